//! HTTP 交换：`Opened → (Receiving) → Completed | Aborted`。
//!
//! - 无 body 的方法在打开时立即调用路由回调 `(req, res)`；
//! - POST 为流式：每个分块调用一次 `(req, res, chunk, last)`；
//! - PUT/PATCH 为缓冲式：末块到达后调用一次 `(req, res, body)`；
//! - 中间件在打开时按注册顺序运行一次，返回 `false` 或失败即短路。

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::native::{ConnectionId, HttpMethod, HttpResponse, RequestInfo};
use crate::response::ResponseHandle;
use crate::router::RouteTarget;
use crate::value::{CallbackRef, ScriptValue};

use super::ConnectionManager;

const INTERNAL_ERROR: &str = "Internal Server Error";

/// 交换阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangePhase {
    Opened,
    Receiving,
    Completed,
    Aborted,
}

impl ExchangePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangePhase::Completed | ExchangePhase::Aborted)
    }
}

/// 请求 body 的投递方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyMode {
    None,
    Streaming,
    Buffered,
}

impl BodyMode {
    pub fn for_method(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Post => BodyMode::Streaming,
            HttpMethod::Put | HttpMethod::Patch => BodyMode::Buffered,
            _ => BodyMode::None,
        }
    }
}

enum Delivery {
    Chunk(Bytes, bool),
    Body(Bytes),
}

struct ExchangeState {
    phase: ExchangePhase,
    body: BytesMut,
    body_complete: bool,
}

/// 一次进行中的 HTTP 交换。
pub struct HttpExchange {
    request: Arc<RequestInfo>,
    response: ResponseHandle,
    handler: Option<CallbackRef>,
    mode: BodyMode,
    state: Mutex<ExchangeState>,
}

impl HttpExchange {
    fn new(
        request: Arc<RequestInfo>,
        response: ResponseHandle,
        handler: Option<CallbackRef>,
        mode: BodyMode,
    ) -> Self {
        Self {
            request,
            response,
            handler,
            mode,
            state: Mutex::new(ExchangeState {
                phase: ExchangePhase::Opened,
                body: BytesMut::new(),
                body_complete: false,
            }),
        }
    }

    pub fn phase(&self) -> ExchangePhase {
        self.state.lock().phase
    }

    pub fn request(&self) -> &Arc<RequestInfo> {
        &self.request
    }

    pub fn response(&self) -> &ResponseHandle {
        &self.response
    }

    fn base_args(&self) -> Vec<ScriptValue> {
        vec![
            ScriptValue::Request(self.request.clone()),
            ScriptValue::Response(self.response.clone()),
        ]
    }

    fn begin_receiving(&self) {
        let mut state = self.state.lock();
        if state.phase == ExchangePhase::Opened {
            state.phase = ExchangePhase::Receiving;
        }
    }

    fn accept(&self, chunk: Bytes, last: bool) -> Option<Delivery> {
        let mut state = self.state.lock();
        if state.phase != ExchangePhase::Receiving || state.body_complete {
            return None;
        }
        state.body_complete = last;
        match self.mode {
            BodyMode::Streaming => Some(Delivery::Chunk(chunk, last)),
            BodyMode::Buffered => {
                state.body.extend_from_slice(&chunk);
                last.then(|| Delivery::Body(std::mem::take(&mut state.body).freeze()))
            }
            BodyMode::None => None,
        }
    }

    /// 终态迁移，只有第一次返回 `true`。
    fn finish(&self, phase: ExchangePhase) -> bool {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return false;
        }
        state.phase = phase;
        state.body.clear();
        true
    }

    fn abort(&self) -> bool {
        let first = self.finish(ExchangePhase::Aborted);
        self.response.mark_aborted();
        first
    }

    /// 服务器侧终止：关闭仍然打开的响应。
    pub(super) fn shutdown(&self) {
        self.finish(ExchangePhase::Aborted);
        let _ = self.response.close();
    }
}

impl fmt::Debug for HttpExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExchange")
            .field("method", &self.request.method)
            .field("url", &self.request.url)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ConnectionManager {
    pub(super) fn on_http_open(
        &self,
        conn: ConnectionId,
        mut request: RequestInfo,
        native: Arc<dyn HttpResponse>,
    ) {
        let response = ResponseHandle::new(conn, native);
        let Some(matched) = self.router.match_http(request.method, &request.url) else {
            tracing::debug!(target: "spark_script::connection", %conn, method = %request.method, url = %request.url, "no route matched");
            response.respond_text(404, "Not Found");
            return;
        };
        request.params = matched.params;
        let request = Arc::new(request);
        let (handler, mode) = match &matched.target {
            RouteTarget::Handler(callback) => {
                (Some(*callback), BodyMode::for_method(request.method))
            }
            RouteTarget::Sse(_) | RouteTarget::Static(_) => (None, BodyMode::None),
        };

        let exchange = Arc::new(HttpExchange::new(
            request.clone(),
            response.clone(),
            handler,
            mode,
        ));
        let table = Arc::downgrade(&self.exchanges);
        response.set_finish_hook(move |conn| {
            if let Some(table) = table.upgrade()
                && let Some((_, exchange)) = table.remove(&conn)
            {
                exchange.finish(ExchangePhase::Completed);
            }
        });
        self.exchanges.insert(conn, exchange.clone());

        if !self.run_middleware(&matched.middleware, &exchange) {
            return;
        }

        match matched.target {
            RouteTarget::Handler(callback) => {
                if mode == BodyMode::None {
                    self.invoke_handler(&exchange, callback, exchange.base_args());
                } else {
                    exchange.begin_receiving();
                }
            }
            RouteTarget::Sse(behavior) => self.open_stream(&exchange, behavior),
            RouteTarget::Static(mount) => {
                mount.serve(&request.url, &response, &self.transfers);
            }
        }
    }

    pub(super) fn on_http_data(&self, conn: ConnectionId, chunk: Bytes, last: bool) {
        let Some(exchange) = self.exchanges.get(&conn).map(|entry| entry.value().clone()) else {
            tracing::trace!(target: "spark_script::connection", %conn, "data for unknown exchange dropped");
            return;
        };
        let Some(callback) = exchange.handler else {
            return;
        };
        let mut args = exchange.base_args();
        match exchange.accept(chunk, last) {
            Some(Delivery::Chunk(chunk, last)) => {
                args.push(ScriptValue::Bytes(chunk));
                args.push(ScriptValue::Bool(last));
            }
            Some(Delivery::Body(body)) => args.push(ScriptValue::Bytes(body)),
            None => return,
        }
        self.invoke_handler(&exchange, callback, args);
    }

    pub(super) fn on_http_aborted(&self, conn: ConnectionId) {
        self.transfers.abort(conn);
        if let Some((_, exchange)) = self.exchanges.remove(&conn)
            && exchange.abort()
        {
            tracing::debug!(target: "spark_script::connection", %conn, url = %exchange.request.url, "request aborted by peer");
        }
        self.abort_stream(conn);
    }

    /// 返回是否放行。
    fn run_middleware(&self, chain: &[CallbackRef], exchange: &HttpExchange) -> bool {
        for callback in chain {
            match self
                .bridge
                .invoke_predicate("http.middleware", *callback, exchange.base_args())
            {
                Ok(true) => {}
                Ok(false) => {
                    exchange.response.respond_text(403, "Forbidden");
                    return false;
                }
                Err(_) => {
                    exchange.response.respond_text(500, INTERNAL_ERROR);
                    return false;
                }
            }
        }
        true
    }

    fn invoke_handler(&self, exchange: &HttpExchange, callback: CallbackRef, args: Vec<ScriptValue>) {
        if self.bridge.invoke("http.route", callback, args).is_err() {
            exchange.response.respond_text(500, INTERNAL_ERROR);
        }
    }
}
