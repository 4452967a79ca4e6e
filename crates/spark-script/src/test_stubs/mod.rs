//! 原生引擎与解释器协作方的测试桩集合。
//!
//! # 设计定位（Why）
//! - 单元测试、契约测试与基准都需要一个“可观测”的原生响应、WebSocket 连接、事件循环与解释器；
//!   集中在此处定义，接口调整时只需单点修改。
//!
//! # 使用方式（How）
//! - `use spark_script::test_stubs::{RecordingResponse, ScriptedEngine, StubNativeEngine};`
//! - 记录型桩把每次调用追加到内部列表，测试结束后读取断言；
//! - [`ScriptedEngine`] 用闭包模拟脚本回调，克隆体共享同一张回调表。
//!
//! # 风险与权衡（Trade-offs）
//! - 这些类型随 crate 对外可见，仅用于测试与示例；生产环境请接入真实的原生引擎与解释器。

pub mod native {
    //! 原生引擎侧的记录型桩。

    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::native::{
        EventSink, HttpResponse, ListenSocket, NativeEngine, NativeEvent, OpCode, SendStatus,
        WebSocketConnection, WriteStatus,
    };

    #[derive(Default)]
    struct ResponseLog {
        status: Option<u16>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        budget: Option<usize>,
        write_calls: usize,
        full_count: usize,
        end_count: usize,
        close_count: usize,
    }

    /// 记录全部调用的 HTTP 响应。
    ///
    /// 设置预算后，`try_write` 只接收不超过剩余预算的整块，其余返回 `Full`，
    /// 用于模拟发送缓冲已满。
    pub struct RecordingResponse {
        log: Mutex<ResponseLog>,
        remote_address: String,
    }

    impl RecordingResponse {
        pub fn new() -> Self {
            Self {
                log: Mutex::new(ResponseLog::default()),
                remote_address: "127.0.0.1".to_owned(),
            }
        }

        /// 以有限的发送预算创建。
        pub fn with_budget(budget: usize) -> Self {
            let response = Self::new();
            response.log.lock().budget = Some(budget);
            response
        }

        pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
            self.remote_address = address.into();
            self
        }

        /// 追加发送预算。
        pub fn grant(&self, bytes: usize) {
            let mut log = self.log.lock();
            if let Some(budget) = log.budget.as_mut() {
                *budget += bytes;
            }
        }

        pub fn status(&self) -> Option<u16> {
            self.log.lock().status
        }

        /// 大小写不敏感地读取最后一次写入的同名响应头。
        pub fn header(&self, name: &str) -> Option<String> {
            self.log
                .lock()
                .headers
                .iter()
                .rev()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        }

        pub fn headers(&self) -> Vec<(String, String)> {
            self.log.lock().headers.clone()
        }

        pub fn body(&self) -> Vec<u8> {
            self.log.lock().body.clone()
        }

        pub fn body_text(&self) -> String {
            String::from_utf8_lossy(&self.log.lock().body).into_owned()
        }

        pub fn write_calls(&self) -> usize {
            self.log.lock().write_calls
        }

        pub fn full_count(&self) -> usize {
            self.log.lock().full_count
        }

        pub fn end_count(&self) -> usize {
            self.log.lock().end_count
        }

        pub fn close_count(&self) -> usize {
            self.log.lock().close_count
        }

        pub fn is_closed(&self) -> bool {
            let log = self.log.lock();
            log.end_count + log.close_count > 0
        }
    }

    impl Default for RecordingResponse {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HttpResponse for RecordingResponse {
        fn write_status(&self, status: u16) {
            self.log.lock().status = Some(status);
        }

        fn write_header(&self, name: &str, value: &str) {
            self.log
                .lock()
                .headers
                .push((name.to_owned(), value.to_owned()));
        }

        fn try_write(&self, chunk: &[u8]) -> WriteStatus {
            let mut log = self.log.lock();
            log.write_calls += 1;
            if let Some(budget) = log.budget {
                if chunk.len() > budget {
                    log.full_count += 1;
                    return WriteStatus::Full;
                }
                log.budget = Some(budget - chunk.len());
            }
            log.body.extend_from_slice(chunk);
            WriteStatus::Written
        }

        fn end(&self, body: &[u8]) {
            let mut log = self.log.lock();
            log.body.extend_from_slice(body);
            log.end_count += 1;
        }

        fn close(&self) {
            self.log.lock().close_count += 1;
        }

        fn remote_address(&self) -> String {
            self.remote_address.clone()
        }
    }

    /// 记录发送帧与关闭请求的 WebSocket 连接。
    pub struct RecordingWebSocket {
        sent: Mutex<Vec<(Vec<u8>, OpCode)>>,
        closes: Mutex<Vec<(u16, String)>>,
        status: Mutex<SendStatus>,
    }

    impl RecordingWebSocket {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
                status: Mutex::new(SendStatus::Sent),
            }
        }

        /// 后续 `send` 返回的状态。
        pub fn set_send_status(&self, status: SendStatus) {
            *self.status.lock() = status;
        }

        pub fn sent(&self) -> Vec<(Vec<u8>, OpCode)> {
            self.sent.lock().clone()
        }

        pub fn closes(&self) -> Vec<(u16, String)> {
            self.closes.lock().clone()
        }
    }

    impl Default for RecordingWebSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl WebSocketConnection for RecordingWebSocket {
        fn send(&self, payload: &[u8], opcode: OpCode) -> SendStatus {
            self.sent.lock().push((payload.to_vec(), opcode));
            *self.status.lock()
        }

        fn close(&self, code: u16, reason: &str) {
            self.closes.lock().push((code, reason.to_owned()));
        }

        fn remote_address(&self) -> String {
            "127.0.0.1".to_owned()
        }
    }

    /// 记录关闭状态的监听套接字。
    #[derive(Debug)]
    pub struct RecordingListenSocket {
        port: u16,
        closed: AtomicBool,
    }

    impl RecordingListenSocket {
        pub fn new(port: u16) -> Self {
            Self {
                port,
                closed: AtomicBool::new(false),
            }
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    impl ListenSocket for RecordingListenSocket {
        fn port(&self) -> u16 {
            self.port
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    /// 内存中的事件循环。
    ///
    /// `run` 依次投递排队的事件，每投递一批调用一次 `after_iteration`，
    /// 直到被 `stop` 或者一次迭代之后队列仍为空。
    pub struct StubNativeEngine {
        queue: Mutex<VecDeque<NativeEvent>>,
        failing_ports: Mutex<Vec<u16>>,
        sockets: Mutex<Vec<Arc<RecordingListenSocket>>>,
        stopped: AtomicBool,
        wakes: AtomicUsize,
        iterations: AtomicUsize,
    }

    /// 端口 `0` 绑定时分配的端口。
    pub const EPHEMERAL_PORT: u16 = 49_152;

    impl StubNativeEngine {
        pub fn new() -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                failing_ports: Mutex::new(Vec::new()),
                sockets: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                wakes: AtomicUsize::new(0),
                iterations: AtomicUsize::new(0),
            }
        }

        /// 之后对该端口的 `listen` 返回 `AddrInUse`。
        pub fn fail_port(&self, port: u16) {
            self.failing_ports.lock().push(port);
        }

        pub fn push(&self, event: NativeEvent) {
            self.queue.lock().push_back(event);
        }

        pub fn sockets(&self) -> Vec<Arc<RecordingListenSocket>> {
            self.sockets.lock().clone()
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::Acquire)
        }

        pub fn wake_count(&self) -> usize {
            self.wakes.load(Ordering::Acquire)
        }

        pub fn iterations(&self) -> usize {
            self.iterations.load(Ordering::Acquire)
        }

        fn pop(&self) -> Option<NativeEvent> {
            self.queue.lock().pop_front()
        }
    }

    impl Default for StubNativeEngine {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NativeEngine for StubNativeEngine {
        fn listen(&self, port: u16) -> io::Result<Arc<dyn ListenSocket>> {
            if self.failing_ports.lock().contains(&port) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("port {port} is already in use"),
                ));
            }
            let bound = if port == 0 { EPHEMERAL_PORT } else { port };
            let socket = Arc::new(RecordingListenSocket::new(bound));
            self.sockets.lock().push(socket.clone());
            Ok(socket)
        }

        fn run(&self, sink: &dyn EventSink) {
            while !self.is_stopped() {
                let mut delivered = 0;
                while let Some(event) = self.pop() {
                    sink.deliver(event);
                    delivered += 1;
                }
                sink.after_iteration();
                self.iterations.fetch_add(1, Ordering::AcqRel);
                if delivered == 0 && self.queue.lock().is_empty() {
                    break;
                }
            }
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::Release);
        }

        fn wake(&self) {
            self.wakes.fetch_add(1, Ordering::AcqRel);
        }
    }
}

pub mod script {
    //! 解释器侧的桩：用闭包扮演脚本回调。

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use crate::bridge::ScriptEngine;
    use crate::error::ScriptError;
    use crate::value::{CallbackRef, ScriptRef, ScriptValue};

    type ScriptFn =
        Arc<dyn Fn(&[ScriptValue]) -> Result<Vec<ScriptValue>, ScriptError> + Send + Sync>;

    #[derive(Default)]
    struct Inner {
        callbacks: Mutex<HashMap<CallbackRef, ScriptFn>>,
        next: AtomicU64,
        calls: Mutex<Vec<(CallbackRef, Vec<ScriptValue>)>>,
        released_callbacks: Mutex<Vec<CallbackRef>>,
        released_values: Mutex<Vec<ScriptRef>>,
    }

    /// 以闭包驱动的解释器。克隆体共享状态。
    ///
    /// 调用闭包时不持有任何内部锁，闭包可以重入运行时。
    #[derive(Clone, Default)]
    pub struct ScriptedEngine {
        inner: Arc<Inner>,
    }

    impl ScriptedEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register<F>(&self, callback: F) -> CallbackRef
        where
            F: Fn(&[ScriptValue]) -> Result<Vec<ScriptValue>, ScriptError> + Send + Sync + 'static,
        {
            let id = CallbackRef::new(self.inner.next.fetch_add(1, Ordering::Relaxed) + 1);
            self.inner.callbacks.lock().insert(id, Arc::new(callback));
            id
        }

        /// 注册一个什么也不做的回调。
        pub fn noop(&self) -> CallbackRef {
            self.register(|_| Ok(Vec::new()))
        }

        /// 某回调收到的全部参数列表，按调用顺序。
        pub fn calls_to(&self, callback: CallbackRef) -> Vec<Vec<ScriptValue>> {
            self.inner
                .calls
                .lock()
                .iter()
                .filter(|(id, _)| *id == callback)
                .map(|(_, args)| args.clone())
                .collect()
        }

        pub fn call_count(&self, callback: CallbackRef) -> usize {
            self.inner
                .calls
                .lock()
                .iter()
                .filter(|(id, _)| *id == callback)
                .count()
        }

        pub fn total_calls(&self) -> usize {
            self.inner.calls.lock().len()
        }

        pub fn is_released(&self, callback: CallbackRef) -> bool {
            self.inner.released_callbacks.lock().contains(&callback)
        }

        pub fn release_count(&self, callback: CallbackRef) -> usize {
            self.inner
                .released_callbacks
                .lock()
                .iter()
                .filter(|id| **id == callback)
                .count()
        }

        pub fn released_values(&self) -> Vec<ScriptRef> {
            self.inner.released_values.lock().clone()
        }
    }

    impl ScriptEngine for ScriptedEngine {
        fn call(
            &self,
            callback: CallbackRef,
            args: Vec<ScriptValue>,
        ) -> Result<Vec<ScriptValue>, ScriptError> {
            self.inner.calls.lock().push((callback, args.clone()));
            let function = self.inner.callbacks.lock().get(&callback).cloned();
            match function {
                Some(function) => function(&args),
                None => Err(ScriptError::new(format!(
                    "attempt to call unknown callback #{}",
                    callback.get()
                ))),
            }
        }

        fn release_callback(&self, callback: CallbackRef) {
            self.inner.released_callbacks.lock().push(callback);
        }

        fn release_value(&self, value: ScriptRef) {
            self.inner.released_values.lock().push(value);
        }
    }
}

pub use self::native::{
    EPHEMERAL_PORT, RecordingListenSocket, RecordingResponse, RecordingWebSocket,
    StubNativeEngine,
};
pub use self::script::ScriptedEngine;
