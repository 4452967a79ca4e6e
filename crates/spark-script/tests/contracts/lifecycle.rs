//! 生命周期契约：监听、推迟执行的热重启、关机与原生循环驱动。

mod support;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use spark_script::test_stubs::{EPHEMERAL_PORT, RecordingResponse};
use spark_script::{
    CallbackRef, HttpMethod, NativeEvent, RequestInfo, Runtime, ScriptError, ScriptValue,
    ServerState, TimerId, WebSocketBehavior,
};
use tracing_test::traced_test;

use support::Harness;

fn script_err(err: spark_script::RuntimeError) -> ScriptError {
    ScriptError::new(err.to_string())
}

fn upgrade(runtime: &Weak<Runtime>) -> Result<Arc<Runtime>, ScriptError> {
    runtime
        .upgrade()
        .ok_or_else(|| ScriptError::new("runtime dropped"))
}

/// 以固定文本应答的处理器。
fn reply(harness: &Harness, body: &'static str) -> CallbackRef {
    harness.scripts.register(move |args| {
        let res = args[1].as_response().expect("res");
        res.end(body.as_bytes()).map_err(script_err)?;
        Ok(Vec::new())
    })
}

#[traced_test]
#[test]
fn listen_reports_port_and_releases_ready_callback() {
    let harness = Harness::new();
    let ready = harness.scripts.noop();

    let port = harness.runtime.listen(8080, Some(ready)).expect("监听");
    assert_eq!(port, 8080);
    assert_eq!(harness.runtime.state(), ServerState::Listening);
    assert_eq!(
        harness.scripts.calls_to(ready),
        vec![vec![ScriptValue::Bool(true), ScriptValue::Integer(8080)]]
    );
    assert!(harness.scripts.is_released(ready));
    assert_eq!(harness.app().listen_port(), Some(8080));
    assert!(logs_contain("Listening on port 8080"));

    let err = harness.runtime.listen(9090, None).expect_err("重复监听");
    assert_eq!(err.code(), "spark.script.invalid_state");
}

#[test]
fn ephemeral_port_is_reported() {
    let harness = Harness::new();
    assert_eq!(harness.runtime.listen(0, None).expect("监听"), EPHEMERAL_PORT);
    assert_eq!(harness.runtime.server().port(), Some(EPHEMERAL_PORT));
}

/// 绑定失败：就绪回调收到 `(false, message)`，状态保持 `Created`，不会 panic。
#[test]
fn bind_failure_is_reported_to_script() {
    let harness = Harness::new();
    harness.native.fail_port(80);
    let ready = harness.scripts.noop();

    let err = harness.runtime.listen(80, Some(ready)).expect_err("端口占用");
    assert_eq!(err.code(), "spark.script.bind_failed");
    assert_eq!(harness.runtime.state(), ServerState::Created);
    let args = &harness.scripts.calls_to(ready)[0];
    assert_eq!(args[0], ScriptValue::Bool(false));
    assert!(args[1].as_str().is_some_and(|msg| msg.contains("80")));
    assert!(harness.scripts.is_released(ready));

    assert_eq!(harness.runtime.listen(81, None).expect("换端口后成功"), 81);
}

/// 处理器内部请求重启：当前分发照常完成，切换发生在迭代结束时。
/// 旧实例的连接被关闭、回调被释放，新实例按原端口重新监听并只包含重新注册的路由。
#[test]
fn deferred_restart_replaces_application() {
    let harness = Harness::new();
    let runtime = Arc::downgrade(&harness.runtime);

    let v2 = reply(&harness, "v2");
    let reregister = {
        let runtime = runtime.clone();
        harness.scripts.register(move |_| {
            upgrade(&runtime)?.get("/version", v2).map_err(script_err)?;
            Ok(Vec::new())
        })
    };
    let done = harness.scripts.noop();
    let restart = {
        let runtime = runtime.clone();
        harness.scripts.register(move |args| {
            upgrade(&runtime)?
                .request_restart(reregister, Some(done))
                .map_err(script_err)?;
            let res = args[1].as_response().expect("res");
            res.end(b"restarting").map_err(script_err)?;
            Ok(Vec::new())
        })
    };
    let v1 = reply(&harness, "v1");
    let ws_close = harness.scripts.noop();
    let ticker = harness.scripts.noop();

    harness.runtime.get("/version", v1).expect("注册");
    harness.runtime.get("/old-only", v1).expect("注册");
    harness.runtime.post("/restart", restart).expect("注册");
    harness
        .runtime
        .ws(
            "/live",
            WebSocketBehavior {
                open: None,
                message: None,
                close: Some(ws_close),
            },
        )
        .expect("注册");
    harness
        .runtime
        .set_interval(ticker, Duration::from_secs(60), Vec::new())
        .expect("注册定时器");
    harness.runtime.listen(8080, None).expect("监听");
    let (_ws_conn, socket) = harness.open_ws("/live");

    let (conn, res) = harness.open_http(HttpMethod::Post, "/restart");
    harness.send_body(conn, b"", true);
    assert_eq!(res.body_text(), "restarting");
    assert_eq!(harness.app().epoch(), 1, "请求只登记，不立即切换");
    assert!(harness.runtime.server().has_pending_restart());
    assert!(harness.native.wake_count() >= 1);

    harness.advance(Duration::from_millis(1));

    let app = harness.app();
    assert_eq!(app.epoch(), 2);
    assert_eq!(harness.runtime.state(), ServerState::Listening);
    assert_eq!(app.listen_port(), Some(8080));
    let sockets = harness.native.sockets();
    assert_eq!(sockets.len(), 2);
    assert!(sockets[0].is_closed());
    assert!(!sockets[1].is_closed());

    assert_eq!(socket.closes()[0].0, 1001);
    assert_eq!(harness.scripts.call_count(ws_close), 0, "静默阶段不调用脚本");
    for callback in [v1, restart, ws_close, ticker, reregister, done] {
        assert!(harness.scripts.is_released(callback), "{callback:?} 未释放");
    }
    assert!(!harness.scripts.is_released(v2));
    assert_eq!(
        harness.scripts.calls_to(done),
        vec![vec![ScriptValue::Bool(true)]]
    );

    let (_conn, res) = harness.open_http(HttpMethod::Get, "/version");
    assert_eq!(res.body_text(), "v2");
    let (_conn, res) = harness.open_http(HttpMethod::Get, "/old-only");
    assert_eq!(res.status(), Some(404));
    assert!(app.timers().is_empty());
}

/// 重启前后的定时器 id 互不重叠：脚本持有的旧 id 不会清除新实例的定时器。
#[test]
fn timer_ids_survive_restart_without_reuse() {
    let harness = Harness::new();
    let runtime = Arc::downgrade(&harness.runtime);
    let old_tick = harness.scripts.noop();
    let new_tick = harness.scripts.noop();
    let old_id = harness
        .runtime
        .set_interval(old_tick, Duration::from_millis(10), Vec::new())
        .expect("注册旧定时器");

    let new_id: Arc<Mutex<Option<TimerId>>> = Arc::default();
    let reregister = {
        let new_id = new_id.clone();
        harness.scripts.register(move |_| {
            let id = upgrade(&runtime)?
                .set_interval(new_tick, Duration::from_millis(10), Vec::new())
                .map_err(script_err)?;
            *new_id.lock() = Some(id);
            Ok(Vec::new())
        })
    };
    harness.runtime.restart_now(reregister, None).expect("重启");

    let new_id = new_id.lock().expect("重新注册了定时器");
    assert!(new_id > old_id, "id 跨实例单调递增：{old_id} → {new_id}");
    assert!(!harness.runtime.clear_timer(old_id), "旧 id 在新实例中未知");
    for _ in 0..10 {
        harness.advance(Duration::from_millis(10));
    }
    assert_eq!(harness.scripts.call_count(new_tick), 10);
    assert_eq!(harness.scripts.call_count(old_tick), 0);
    assert!(harness.runtime.clear_timer(new_id));
}

/// 后到的重启请求覆盖先到的：被覆盖的回调被释放且从不调用。
#[test]
fn newer_restart_request_supersedes_older() {
    let harness = Harness::new();
    let first = harness.scripts.noop();
    let first_done = harness.scripts.noop();
    let second = harness.scripts.noop();

    harness
        .runtime
        .request_restart(first, Some(first_done))
        .expect("登记");
    harness.runtime.request_restart(second, None).expect("登记");
    assert!(harness.scripts.is_released(first));
    assert!(harness.scripts.is_released(first_done));

    harness.runtime.tick();
    assert_eq!(harness.scripts.call_count(first), 0);
    assert_eq!(harness.scripts.call_count(first_done), 0);
    assert_eq!(harness.scripts.call_count(second), 1);
    assert_eq!(harness.app().epoch(), 2);
    assert!(!harness.runtime.server().has_pending_restart());
}

/// 重新注册失败：`done(false, message)`，新实例保持 `Created` 且不监听。
#[test]
fn failed_reregister_reports_to_done() {
    let harness = Harness::new();
    harness.runtime.listen(8080, None).expect("监听");
    let reregister = harness
        .scripts
        .register(|_| Err(ScriptError::new("bad routes")));
    let done = harness.scripts.noop();

    let err = harness
        .runtime
        .restart_now(reregister, Some(done))
        .expect_err("重新注册失败");
    assert_eq!(err.code(), "spark.script.callback_failed");
    assert_eq!(harness.runtime.state(), ServerState::Created);
    assert_eq!(harness.app().listen_port(), None);
    let args = &harness.scripts.calls_to(done)[0];
    assert_eq!(args[0], ScriptValue::Bool(false));
    assert!(args[1].as_str().is_some_and(|msg| msg.contains("bad routes")));
    assert!(harness.scripts.is_released(reregister));
    assert!(harness.scripts.is_released(done));

    assert_eq!(harness.runtime.listen(8080, None).expect("可以手动重新监听"), 8080);
}

/// 关机幂等：停止原生循环、释放全部回调，之后的生命周期操作被拒绝。
#[test]
fn shutdown_is_idempotent() {
    let harness = Harness::new();
    let handler = reply(&harness, "x");
    let pending = harness.scripts.noop();
    harness.runtime.get("/", handler).expect("注册");
    harness.runtime.listen(8080, None).expect("监听");
    harness.runtime.request_restart(pending, None).expect("登记");

    assert!(harness.runtime.shutdown().expect("第一次关机"));
    assert!(!harness.runtime.shutdown().expect("第二次关机"));
    assert_eq!(harness.runtime.state(), ServerState::Terminated);
    assert!(harness.native.is_stopped());
    assert!(harness.native.sockets()[0].is_closed());
    assert!(harness.scripts.is_released(handler));
    assert!(harness.scripts.is_released(pending));
    assert_eq!(harness.scripts.call_count(pending), 0);

    assert_eq!(
        harness.runtime.create_app().expect_err("终止后不能创建").code(),
        "spark.script.invalid_state"
    );
    assert!(harness.runtime.request_restart(pending, None).is_err());
    assert_eq!(
        harness.runtime.get("/", handler).expect_err("没有实例").code(),
        "spark.script.no_application"
    );
}

/// 原生循环投递排队事件并在每次迭代后回调；处理器内关机使循环退出，
/// 之后的事件因没有当前实例而被丢弃。
#[test]
fn native_loop_drives_runtime_until_shutdown() {
    let harness = Harness::new();
    let runtime = Arc::downgrade(&harness.runtime);
    let hello = reply(&harness, "hello");
    let quit = harness.scripts.register(move |_| {
        upgrade(&runtime)?.shutdown().map_err(script_err)?;
        Ok(Vec::new())
    });
    harness.runtime.get("/hello", hello).expect("注册");
    harness.runtime.get("/quit", quit).expect("注册");
    harness.runtime.listen(0, None).expect("监听");

    let responses: Vec<Arc<RecordingResponse>> =
        (0..3).map(|_| Arc::new(RecordingResponse::new())).collect();
    for (index, url) in ["/hello", "/quit", "/hello"].into_iter().enumerate() {
        harness.native.push(NativeEvent::HttpOpen {
            conn: harness.next_conn(),
            request: RequestInfo::new(HttpMethod::Get, url),
            response: responses[index].clone(),
        });
    }

    harness.runtime.run();

    assert_eq!(responses[0].body_text(), "hello");
    assert_eq!(responses[1].close_count(), 1, "关机时未完成的交换被关闭");
    assert_eq!(responses[2].status(), None);
    assert_eq!(responses[2].end_count(), 0);
    assert!(harness.native.is_stopped());
    assert!(harness.native.iterations() >= 1);
    assert_eq!(harness.runtime.state(), ServerState::Terminated);
}
