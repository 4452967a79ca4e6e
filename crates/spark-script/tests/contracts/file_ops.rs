//! 文件操作契约：同步两元组、异步完成只在事件循环线程投递、重启时取消。

mod support;

use std::time::{Duration, Instant};

use bytes::Bytes;
use spark_script::{ScriptError, ScriptValue};

use support::Harness;

/// 反复推进迭代，直到投递了至少一个异步完成或超时。
fn pump_until_delivered(harness: &Harness) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let delivered = harness
            .runtime
            .tick()
            .map_or(0, |report| report.file_completions);
        if delivered > 0 || Instant::now() > deadline {
            return delivered;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn sync_read_and_write_return_pairs() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("note.txt");

    let written = harness.runtime.write_file(&path, b"hello");
    assert_eq!(written, vec![ScriptValue::Bool(true), ScriptValue::Integer(5)]);

    let read = harness.runtime.read_file(&path);
    assert_eq!(read[0], ScriptValue::Bool(true));
    assert_eq!(read[1].as_bytes(), Some(&b"hello"[..]));

    let missing = harness.runtime.read_file(dir.path().join("missing.txt"));
    assert_eq!(missing[0], ScriptValue::Bool(false));
    assert!(missing[1].as_str().is_some_and(|msg| msg.contains("missing.txt")));

    let unwritable = harness
        .runtime
        .write_file(dir.path().join("no-such-dir").join("x"), b"x");
    assert_eq!(unwritable[0], ScriptValue::Bool(false));
}

/// 异步写入后异步读取：回调只在迭代中被调用，调用后立即释放；完成会唤醒原生循环。
#[test]
fn async_roundtrip_runs_on_loop_thread() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("async.txt");
    let loop_thread = std::thread::current().id();

    let on_write = harness.scripts.register(move |_| {
        if std::thread::current().id() != loop_thread {
            return Err(ScriptError::new("completion delivered off the loop thread"));
        }
        Ok(Vec::new())
    });
    harness
        .runtime
        .write_file_async(&path, Bytes::from_static(b"payload"), on_write)
        .expect("提交写入");
    assert_eq!(pump_until_delivered(&harness), 1);
    assert_eq!(
        harness.scripts.calls_to(on_write),
        vec![vec![ScriptValue::Bool(true), ScriptValue::Integer(7)]]
    );
    assert!(harness.scripts.is_released(on_write));
    assert_eq!(harness.runtime.bridge().stats().failures, 0);

    let on_read = harness.scripts.noop();
    harness
        .runtime
        .read_file_async(&path, on_read)
        .expect("提交读取");
    assert_eq!(pump_until_delivered(&harness), 1);
    let calls = harness.scripts.calls_to(on_read);
    assert_eq!(calls[0][0], ScriptValue::Bool(true));
    assert_eq!(calls[0][1].as_bytes(), Some(&b"payload"[..]));
    assert_eq!(harness.app().files().pending_len(), 0);
}

#[test]
fn async_failure_is_reported_as_false_pair() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let on_read = harness.scripts.noop();
    harness
        .runtime
        .read_file_async(dir.path().join("absent.bin"), on_read)
        .expect("提交读取");

    assert_eq!(pump_until_delivered(&harness), 1);
    let calls = harness.scripts.calls_to(on_read);
    assert_eq!(calls[0][0], ScriptValue::Bool(false));
    assert!(calls[0][1].as_str().is_some_and(|msg| msg.contains("absent.bin")));
}

/// 重启前未投递的完成被丢弃：回调被释放且从不调用。
#[test]
fn restart_cancels_pending_operations() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("slow.txt");
    std::fs::write(&path, b"data").expect("写入夹具");

    let on_read = harness.scripts.noop();
    harness
        .runtime
        .read_file_async(&path, on_read)
        .expect("提交读取");
    let reregister = harness.scripts.noop();
    harness
        .runtime
        .restart_now(reregister, None)
        .expect("重启");

    assert!(harness.scripts.is_released(on_read));
    std::thread::sleep(Duration::from_millis(50));
    let report = harness.runtime.tick().expect("新实例存在");
    assert_eq!(report.file_completions, 0);
    assert_eq!(harness.scripts.call_count(on_read), 0);
}
