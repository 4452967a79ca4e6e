//! SSE 契约：响应头提交、事件分帧、背压排队与关闭回调恰好一次。

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use spark_script::test_stubs::RecordingResponse;
use spark_script::{
    ConnectionId, EventSink, HttpMethod, HttpResponse, NativeEvent, RequestInfo, Runtime,
    RuntimeConfig, ScriptError, SseBehavior, SseEvent, SseSendStatus, WriteStatus,
};

use support::Harness;

struct Feed {
    open: spark_script::CallbackRef,
    close: spark_script::CallbackRef,
    ids: Arc<Mutex<Vec<String>>>,
}

fn feed(harness: &Harness) -> Feed {
    let ids: Arc<Mutex<Vec<String>>> = Arc::default();
    let open = {
        let ids = ids.clone();
        harness.scripts.register(move |args| {
            let id = args[0].as_str().expect("stream id").to_owned();
            let req = args[1].as_request().expect("req");
            if req.url != "/events" {
                return Err(ScriptError::new("unexpected url"));
            }
            ids.lock().push(id);
            Ok(Vec::new())
        })
    };
    let close = harness.scripts.noop();
    harness
        .runtime
        .sse(
            "/events",
            SseBehavior {
                open,
                close: Some(close),
            },
        )
        .expect("注册 sse 端点");
    Feed { open, close, ids }
}

fn connect(harness: &Harness, response: Arc<RecordingResponse>) -> spark_script::ConnectionId {
    harness.open_request(RequestInfo::new(HttpMethod::Get, "/events"), response)
}

#[test]
fn open_commits_event_stream_head() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let (_conn, res) = harness.open_http(HttpMethod::Get, "/events");

    assert_eq!(res.status(), Some(200));
    assert_eq!(res.header("Content-Type").as_deref(), Some("text/event-stream"));
    assert_eq!(res.header("Cache-Control").as_deref(), Some("no-cache"));
    assert_eq!(res.body_text(), ":ok\n\n");
    assert_eq!(res.end_count(), 0, "流保持打开");
    assert_eq!(harness.scripts.call_count(feed.open), 1);
    assert_eq!(feed.ids.lock().len(), 1);
    assert_eq!(harness.app().connections().open_streams(), 1);
}

#[test]
fn events_are_framed_in_order() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let (_conn, res) = harness.open_http(HttpMethod::Get, "/events");
    let id = feed.ids.lock()[0].clone();

    let status = harness
        .runtime
        .sse_send(&id, &SseEvent::data("line1\nline2").with_event("update").with_id("1"))
        .expect("发送");
    assert_eq!(status, SseSendStatus::Sent);
    harness
        .runtime
        .sse_send(&id, &SseEvent::data("second"))
        .expect("发送");

    assert_eq!(
        res.body_text(),
        ":ok\n\nid: 1\nevent: update\ndata: line1\ndata: line2\n\ndata: second\n\n"
    );
}

/// 发送缓冲已满时帧按序排队，可写通知到来后依次冲刷。
#[test]
fn backpressured_frames_are_flushed_in_order() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let res = Arc::new(RecordingResponse::with_budget(5));
    let conn = connect(&harness, res.clone());
    let id = feed.ids.lock()[0].clone();

    let first = harness.runtime.sse_send(&id, &SseEvent::data("a")).expect("发送");
    let second = harness.runtime.sse_send(&id, &SseEvent::data("b")).expect("发送");
    assert_eq!(first, SseSendStatus::Backpressured);
    assert_eq!(second, SseSendStatus::Backpressured, "已有积压时后续帧直接排队");
    assert_eq!(res.body_text(), ":ok\n\n");

    res.grant(9);
    harness.writable(conn);
    assert_eq!(res.body_text(), ":ok\n\ndata: a\n\n");

    res.grant(64);
    harness.writable(conn);
    assert_eq!(res.body_text(), ":ok\n\ndata: a\n\ndata: b\n\n");
    assert_eq!(
        harness.runtime.sse_send(&id, &SseEvent::data("c")).expect("发送"),
        SseSendStatus::Sent
    );
}

/// 打开时连前导帧都写不进去：前导帧排在队首，顺序不变。
#[test]
fn preamble_waits_for_writable() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let res = Arc::new(RecordingResponse::with_budget(0));
    let conn = connect(&harness, res.clone());
    let id = feed.ids.lock()[0].clone();

    assert_eq!(
        harness.runtime.sse_send(&id, &SseEvent::data("x")).expect("发送"),
        SseSendStatus::Backpressured
    );
    res.grant(1024);
    harness.writable(conn);
    assert_eq!(res.body_text(), ":ok\n\ndata: x\n\n");
}

/// 两次 `sse_close`：恰好一次清理与一次关闭回调；关闭后发送得到 `ResourceClosed`。
#[test]
fn double_close_cleans_up_once() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let (_conn, res) = harness.open_http(HttpMethod::Get, "/events");
    let id = feed.ids.lock()[0].clone();

    harness.runtime.sse_close(&id).expect("第一次关闭");
    harness.runtime.sse_close(&id).expect("重复关闭是空操作");

    assert_eq!(res.end_count(), 1);
    assert_eq!(harness.scripts.call_count(feed.close), 1);
    assert_eq!(
        harness.scripts.calls_to(feed.close)[0][0].as_str(),
        Some(id.as_str())
    );
    assert_eq!(harness.app().connections().open_streams(), 0);
    assert_eq!(harness.app().connections().open_exchanges(), 0);
    assert!(harness.app().streams().is_empty());

    let err = harness
        .runtime
        .sse_send(&id, &SseEvent::data("late"))
        .expect_err("关闭后发送失败");
    assert_eq!(err.code(), "spark.script.resource_closed");
}

/// 对端中止触发关闭回调，原生响应不再被触碰。
#[test]
fn peer_abort_triggers_close_callback() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let (conn, res) = harness.open_http(HttpMethod::Get, "/events");
    let id = feed.ids.lock()[0].clone();

    harness.abort(conn);
    harness.abort(conn);
    assert_eq!(harness.scripts.call_count(feed.close), 1);
    assert_eq!(res.end_count(), 0);
    assert!(harness.runtime.sse_send(&id, &SseEvent::data("x")).is_err());
    harness.runtime.sse_close(&id).expect("中止后关闭是空操作");
    assert_eq!(harness.scripts.call_count(feed.close), 1);
}

/// open 回调失败时流被立即结束。
#[test]
fn failing_open_closes_stream() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let res = Arc::new(RecordingResponse::new());
    harness.open_request(RequestInfo::new(HttpMethod::Get, "/events").with_query("x=1"), res.clone());
    assert_eq!(feed.ids.lock().len(), 1);

    let broken_open = harness.scripts.register(|_| Err(ScriptError::new("open failed")));
    harness
        .runtime
        .sse("/broken", SseBehavior { open: broken_open, close: None })
        .expect("注册");
    let (_conn, broken) = harness.open_http(HttpMethod::Get, "/broken");
    assert_eq!(broken.end_count(), 1);
    assert_eq!(harness.app().connections().open_streams(), 1);
}

/// 积压达到上限后新帧被丢弃：队列字节数有界，流保持打开，冲刷后恢复正常发送。
#[test]
fn backlog_is_bounded_by_config() {
    let mut config = RuntimeConfig::default();
    config.sse.max_pending_bytes = 32;
    let harness = Harness::with_config(config);
    let feed = feed(&harness);
    let res = Arc::new(RecordingResponse::with_budget(0));
    let conn = connect(&harness, res.clone());
    let id = feed.ids.lock()[0].clone();

    // 前导帧 5 字节 + 每帧 16 字节：第一帧入队，之后全部丢弃。
    let event = SseEvent::data("abcdefgh");
    assert_eq!(
        harness.runtime.sse_send(&id, &event).expect("发送"),
        SseSendStatus::Backpressured
    );
    let dropped = (0..1000)
        .map(|_| harness.runtime.sse_send(&id, &event).expect("发送"))
        .filter(|status| *status == SseSendStatus::Dropped)
        .count();
    assert_eq!(dropped, 1000);
    assert_eq!(harness.app().connections().open_streams(), 1, "丢弃不关闭流");

    res.grant(1 << 20);
    harness.writable(conn);
    assert_eq!(res.body_text(), ":ok\n\ndata: abcdefgh\n\n");
    assert_eq!(
        harness.runtime.sse_send(&id, &event).expect("发送"),
        SseSendStatus::Sent
    );
    assert_eq!(harness.scripts.call_count(feed.close), 0);
}

/// 在 `try_write` 内部同步投递中止的原生响应。
struct AbortingResponse {
    inner: RecordingResponse,
    target: Mutex<Option<(Weak<Runtime>, ConnectionId)>>,
    armed: AtomicBool,
}

impl HttpResponse for AbortingResponse {
    fn write_status(&self, status: u16) {
        self.inner.write_status(status);
    }

    fn write_header(&self, name: &str, value: &str) {
        self.inner.write_header(name, value);
    }

    fn try_write(&self, chunk: &[u8]) -> WriteStatus {
        if self.armed.swap(false, Ordering::SeqCst) {
            let target = self.target.lock().clone();
            if let Some((runtime, conn)) = target
                && let Some(runtime) = runtime.upgrade()
            {
                runtime.deliver(NativeEvent::HttpAborted { conn });
            }
            return WriteStatus::Full;
        }
        self.inner.try_write(chunk)
    }

    fn end(&self, body: &[u8]) {
        self.inner.end(body);
    }

    fn close(&self) {
        self.inner.close();
    }

    fn remote_address(&self) -> String {
        self.inner.remote_address()
    }
}

/// 原生侧在写入过程中同步投递中止：发送与冲刷都不持有队列锁，清理照常恰好一次。
#[test]
fn abort_during_write_does_not_deadlock() {
    let harness = Harness::new();
    let feed = feed(&harness);
    let res = Arc::new(AbortingResponse {
        inner: RecordingResponse::new(),
        target: Mutex::new(None),
        armed: AtomicBool::new(false),
    });
    let conn = harness.next_conn();
    *res.target.lock() = Some((Arc::downgrade(&harness.runtime), conn));
    harness.runtime.deliver(NativeEvent::HttpOpen {
        conn,
        request: RequestInfo::new(HttpMethod::Get, "/events"),
        response: res.clone(),
    });
    let id = feed.ids.lock()[0].clone();

    res.armed.store(true, Ordering::SeqCst);
    let _ = harness.runtime.sse_send(&id, &SseEvent::data("x"));

    assert_eq!(harness.scripts.call_count(feed.close), 1);
    assert_eq!(harness.app().connections().open_streams(), 0);
    assert!(harness.runtime.sse_send(&id, &SseEvent::data("y")).is_err());
    harness.writable(conn);
}
