//! 文件传输契约：策略边界上的字节记账、背压重试、中止与超时。

mod support;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use spark_script::test_stubs::RecordingResponse;
use spark_script::{
    ConnectionId, HttpMethod, ManualClock, ResponseHandle, RuntimeConfig, TransferEngine,
    TransferLimits, TransferStrategy,
};
use tracing_test::traced_test;

use support::Harness;

const INLINE: u64 = 64;
const MAPPED: u64 = 256;
const CHUNK: usize = 16;

fn limits() -> TransferLimits {
    TransferLimits {
        inline_threshold: INLINE,
        mapped_threshold: MAPPED,
        chunk_size: CHUNK,
        deadline: Duration::from_secs(5),
    }
}

fn fixture(dir: &Path, size: u64) -> (PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let path = dir.join(format!("file-{size}.bin"));
    std::fs::write(&path, &content).expect("写入夹具");
    (path, content)
}

fn boundary_size() -> impl Strategy<Value = u64> {
    prop::sample::select(vec![
        0,
        INLINE - 1,
        INLINE,
        INLINE + 1,
        MAPPED - 1,
        MAPPED,
        MAPPED + 1,
    ])
}

proptest! {
    /// 任意背压预算序列下：写出的字节与文件逐字节一致，响应恰好结束一次，
    /// `Content-Length` 等于文件大小，策略符合阈值。
    #[test]
    fn bytes_are_delivered_exactly_once(
        size in boundary_size(),
        initial in 0usize..48,
        grants in prop::collection::vec(0usize..40, 0..64),
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (path, content) = fixture(dir.path(), size);
        let engine = TransferEngine::new(limits(), Arc::new(ManualClock::new()));
        let native = Arc::new(RecordingResponse::with_budget(initial));
        let conn = ConnectionId::new(1);
        let response = ResponseHandle::new(conn, native.clone());

        let strategy = engine.start(response.clone(), &path).expect("启动传输");
        prop_assert_eq!(strategy, limits().select(size));

        for grant in grants {
            if !engine.is_active(conn) {
                break;
            }
            native.grant(grant);
            engine.on_writable(conn);
        }
        while engine.is_active(conn) {
            native.grant(CHUNK);
            engine.on_writable(conn);
        }

        prop_assert_eq!(native.body(), content);
        prop_assert_eq!(native.end_count(), 1);
        prop_assert_eq!(native.header("Content-Length"), Some(size.to_string()));
        prop_assert_eq!(native.status(), Some(200));
        prop_assert_eq!(response.bytes_written(), size);
        prop_assert_eq!(engine.stats().completed, 1);
        prop_assert_eq!(engine.active_len(), 0);
    }
}

/// 背压时挂起的块在下一次可写时原样重发，不重新读取、不丢弃。
#[test]
fn pending_chunk_is_reoffered_verbatim() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, content) = fixture(dir.path(), INLINE + 8);
    let engine = TransferEngine::new(limits(), Arc::new(ManualClock::new()));
    let native = Arc::new(RecordingResponse::with_budget(CHUNK + 4));
    let conn = ConnectionId::new(3);

    let strategy = engine
        .start(ResponseHandle::new(conn, native.clone()), &path)
        .expect("启动");
    assert_eq!(strategy, TransferStrategy::Buffered);
    assert_eq!(native.body(), content[..CHUNK].to_vec());
    assert_eq!(native.full_count(), 1);

    // 预算不足以容纳整块时继续挂起。
    native.grant(8);
    assert!(engine.on_writable(conn));
    assert_eq!(native.body().len(), CHUNK);

    native.grant(1024);
    assert!(!engine.on_writable(conn));
    assert_eq!(native.body(), content);
    assert_eq!(native.end_count(), 1);
}

/// 对端中止只释放一次，之后的可写事件与中止事件都是空操作。
#[test]
fn abort_releases_session_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _) = fixture(dir.path(), MAPPED + 1);
    let engine = TransferEngine::new(limits(), Arc::new(ManualClock::new()));
    let native = Arc::new(RecordingResponse::with_budget(0));
    let conn = ConnectionId::new(9);
    let response = ResponseHandle::new(conn, native.clone());

    assert_eq!(
        engine.start(response.clone(), &path).expect("启动"),
        TransferStrategy::Mapped
    );
    assert!(engine.is_active(conn));
    assert!(engine.abort(conn));
    assert!(!engine.abort(conn));
    assert!(!engine.on_writable(conn));
    assert_eq!(engine.stats().aborted, 1);
    assert_eq!(native.end_count(), 0);
}

/// 尚无 body 字节被接收就超时：响应头仍可替换，改答 500 并记录超时。
#[traced_test]
#[test]
fn stalled_transfer_before_first_byte_gets_500() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _) = fixture(dir.path(), INLINE * 2);
    let clock = ManualClock::new();
    let engine = TransferEngine::new(limits(), Arc::new(clock.clone()));
    let native = Arc::new(RecordingResponse::with_budget(0));
    let conn = ConnectionId::new(5);
    engine
        .start(ResponseHandle::new(conn, native.clone()), &path)
        .expect("启动");

    clock.advance(Duration::from_secs(4));
    assert_eq!(engine.expire(), 0);
    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.expire(), 1);
    assert_eq!(native.status(), Some(500));
    assert_eq!(native.header("Content-Length").as_deref(), Some("21"));
    assert_eq!(native.body_text(), "Internal Server Error");
    assert_eq!(native.end_count(), 1);
    assert_eq!(native.close_count(), 0);
    assert_eq!(engine.stats().timed_out, 1);
    assert!(!engine.is_active(conn));
    assert!(logs_contain("answering stalled transfer with 500"));
}

/// 已有字节上线后超时：响应头已提交，只能关闭连接。
#[traced_test]
#[test]
fn stalled_transfer_after_first_byte_is_closed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, content) = fixture(dir.path(), INLINE * 2);
    let clock = ManualClock::new();
    let engine = TransferEngine::new(limits(), Arc::new(clock.clone()));
    let native = Arc::new(RecordingResponse::with_budget(CHUNK));
    let conn = ConnectionId::new(6);
    engine
        .start(ResponseHandle::new(conn, native.clone()), &path)
        .expect("启动");
    assert_eq!(native.body(), content[..CHUNK].to_vec());

    clock.advance(Duration::from_secs(5));
    assert_eq!(engine.expire(), 1);
    assert_eq!(native.status(), Some(200));
    assert_eq!(native.close_count(), 1);
    assert_eq!(native.end_count(), 0);
    assert_eq!(engine.stats().timed_out, 1);
    assert!(logs_contain("closing stalled transfer"));
}

/// 分块大小为零的限制被按 1 字节处理，传输仍能完成。
#[test]
fn zero_chunk_size_still_completes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, content) = fixture(dir.path(), INLINE + 3);
    let engine = TransferEngine::new(
        TransferLimits {
            chunk_size: 0,
            ..limits()
        },
        Arc::new(ManualClock::new()),
    );
    let native = Arc::new(RecordingResponse::new());
    let conn = ConnectionId::new(8);

    engine
        .start(ResponseHandle::new(conn, native.clone()), &path)
        .expect("启动");
    assert!(!engine.is_active(conn));
    assert_eq!(native.body(), content);
    assert_eq!(native.end_count(), 1);
    assert_eq!(native.write_calls(), content.len());
}

/// 传输截止由事件循环驱动：应用实例的每次迭代都会执行截止扫描。
#[test]
fn iteration_drives_transfer_deadline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, _) = fixture(dir.path(), INLINE * 2);
    let mut config = RuntimeConfig::default();
    config.transfer.inline_threshold_bytes = INLINE;
    config.transfer.mapped_threshold_bytes = MAPPED;
    config.transfer.chunk_size_bytes = CHUNK;
    config.transfer.deadline_ms = 1_000;
    let harness = Harness::with_config(config);
    harness
        .runtime
        .serve_static("/files", dir.path())
        .expect("挂载");

    let native = Arc::new(RecordingResponse::with_budget(0));
    let conn = harness.open_request(
        spark_script::RequestInfo::new(HttpMethod::Get, &format!("/files/file-{}.bin", INLINE * 2)),
        native.clone(),
    );
    assert!(harness.app().transfers().is_active(conn));

    harness.advance(Duration::from_millis(999));
    assert!(harness.app().transfers().is_active(conn));
    harness.advance(Duration::from_millis(1));
    assert!(!harness.app().transfers().is_active(conn));
    assert_eq!(native.status(), Some(500));
    assert_eq!(native.end_count(), 1);
    assert_eq!(harness.app().connections().open_exchanges(), 0);
}

/// 打不开的文件返回错误，不写任何响应头。
#[test]
fn missing_file_fails_before_headers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = TransferEngine::new(limits(), Arc::new(ManualClock::new()));
    let native = Arc::new(RecordingResponse::new());
    let err = engine
        .start(
            ResponseHandle::new(ConnectionId::new(1), native.clone()),
            &dir.path().join("missing.bin"),
        )
        .expect_err("文件不存在");
    assert_eq!(err.code(), "spark.script.io_failed");
    assert_eq!(native.status(), None);
    assert!(native.headers().is_empty());
}
