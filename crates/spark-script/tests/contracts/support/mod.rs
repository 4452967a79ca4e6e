//! 契约测试共享装配：一个以桩对象驱动的完整运行时。
//!
//! # 模块定位（Why）
//! - 每个契约测试都需要“解释器桩 + 原生引擎桩 + 虚拟时钟 + 已创建的应用实例”，
//!   集中装配避免各测试文件重复拼装；
//! - 事件通过 [`EventSink`] 投递，与真实原生引擎走同一入口。
//!
//! # 使用说明（How）
//! - 各测试文件以 `mod support;` 引入；不同测试目标只用到部分辅助函数，因此允许死代码。

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use spark_script::test_stubs::{RecordingResponse, RecordingWebSocket, ScriptedEngine, StubNativeEngine};
use spark_script::{
    Application, ConnectionId, EventSink, HttpMethod, ManualClock, NativeEvent, OpCode,
    RequestInfo, Runtime, RuntimeConfig,
};

/// 装配完成的运行时。
pub struct Harness {
    pub scripts: ScriptedEngine,
    pub clock: ManualClock,
    pub native: Arc<StubNativeEngine>,
    pub runtime: Arc<Runtime>,
    next_conn: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let scripts = ScriptedEngine::new();
        let clock = ManualClock::new();
        let native = Arc::new(StubNativeEngine::new());
        let runtime = Arc::new(
            Runtime::builder()
                .config(config)
                .clock(clock.clone())
                .build(scripts.clone(), native.clone())
                .expect("有效配置必须构建成功"),
        );
        runtime.create_app().expect("创建应用实例");
        Self {
            scripts,
            clock,
            native,
            runtime,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn app(&self) -> Arc<Application> {
        self.runtime.app().expect("应用实例存在")
    }

    pub fn next_conn(&self) -> ConnectionId {
        ConnectionId::new(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    pub fn open_http(&self, method: HttpMethod, url: &str) -> (ConnectionId, Arc<RecordingResponse>) {
        let response = Arc::new(RecordingResponse::new());
        let conn = self.open_request(RequestInfo::new(method, url), response.clone());
        (conn, response)
    }

    pub fn open_request(&self, request: RequestInfo, response: Arc<RecordingResponse>) -> ConnectionId {
        let conn = self.next_conn();
        self.runtime.deliver(NativeEvent::HttpOpen {
            conn,
            request,
            response,
        });
        conn
    }

    pub fn send_body(&self, conn: ConnectionId, chunk: &[u8], last: bool) {
        self.runtime.deliver(NativeEvent::HttpData {
            conn,
            chunk: Bytes::copy_from_slice(chunk),
            last,
        });
    }

    pub fn writable(&self, conn: ConnectionId) {
        self.runtime.deliver(NativeEvent::HttpWritable { conn });
    }

    pub fn abort(&self, conn: ConnectionId) {
        self.runtime.deliver(NativeEvent::HttpAborted { conn });
    }

    pub fn open_ws(&self, url: &str) -> (ConnectionId, Arc<RecordingWebSocket>) {
        let conn = self.next_conn();
        let socket = Arc::new(RecordingWebSocket::new());
        self.runtime.deliver(NativeEvent::WsOpen {
            conn,
            url: url.to_owned(),
            socket: socket.clone(),
        });
        (conn, socket)
    }

    pub fn ws_message(&self, conn: ConnectionId, payload: &[u8], opcode: OpCode) {
        self.runtime.deliver(NativeEvent::WsMessage {
            conn,
            payload: Bytes::copy_from_slice(payload),
            opcode,
        });
    }

    pub fn ws_close(&self, conn: ConnectionId, code: u16, reason: &str) {
        self.runtime.deliver(NativeEvent::WsClose {
            conn,
            code,
            reason: reason.to_owned(),
        });
    }

    /// 推进虚拟时间并执行一次迭代。
    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
        self.runtime.after_iteration();
    }
}
