//! WebSocket 会话：`Opening → Open → Closing → Closed`。
//!
//! # 教案式说明
//! - **意图（Why）**：脚本持有的 `ws` 句柄可能比连接活得久；关闭回调必须拿到同一个句柄
//!   （此时已是僵尸），并且无论关闭由谁发起都恰好投递一次。
//! - **逻辑（How）**：
//!   - 打开时在注册表中登记句柄，按连接 id 记录会话；
//!   - 脚本 `ws.close()` 先清除活性再通知原生引擎，阶段进入 `Closing`；
//!   - 原生 `WsClose` 事件通过 `DashMap::remove` 认领会话，清除活性（若尚未清除），
//!     认领终态后投递关闭回调，回调返回后才从注册表移除句柄。
//! - **契约（What）**：消息只在 `Open` 阶段投递；关闭后任何需要原生资源的操作返回
//!   `ResourceClosed`。

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::native::{ConnectionId, OpCode, SendStatus, WebSocketConnection};
use crate::registry::{Handle, HandleRegistry, Metadata, NativeResource, SessionPhase};
use crate::router::WebSocketBehavior;
use crate::value::ScriptValue;

use super::ConnectionManager;

/// 正常关闭。
pub const CLOSE_NORMAL: u16 = 1000;
/// 服务器下线或重启。
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// 没有匹配的端点。
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// 脚本可见的 WebSocket 句柄。
#[derive(Clone)]
pub struct WebSocketHandle {
    handle: Arc<Handle>,
    registry: Arc<HandleRegistry>,
}

impl WebSocketHandle {
    pub(crate) fn new(handle: Arc<Handle>, registry: Arc<HandleRegistry>) -> Self {
        Self { handle, registry }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn phase(&self) -> SessionPhase {
        self.handle.phase()
    }

    pub fn is_open(&self) -> bool {
        self.handle.phase() == SessionPhase::Open && self.handle.is_live()
    }

    pub fn send(&self, payload: &[u8], opcode: OpCode) -> Result<SendStatus> {
        Ok(self.socket()?.send(payload, opcode))
    }

    pub fn send_text(&self, text: &str) -> Result<SendStatus> {
        self.send(text.as_bytes(), OpCode::Text)
    }

    /// 发起关闭。第二次调用返回 `ResourceClosed`。
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        let Some(native) = self.registry.kill(&self.handle) else {
            return Err(self.handle.closed_error());
        };
        if self.handle.phase() != SessionPhase::Closed {
            self.handle.set_phase(SessionPhase::Closing);
        }
        if let NativeResource::WebSocket(socket) = native {
            socket.close(code, reason);
        }
        Ok(())
    }

    pub fn remote_address(&self) -> Result<String> {
        Ok(self.socket()?.remote_address())
    }

    /// 死活均可读取。
    pub fn get(&self, key: &str) -> Option<ScriptValue> {
        self.handle.metadata(key)
    }

    pub fn set(&self, key: impl Into<String>, value: ScriptValue) -> Result<()> {
        self.handle.set_metadata(key, value)
    }

    pub fn metadata(&self) -> Metadata {
        self.handle.metadata_snapshot()
    }

    fn socket(&self) -> Result<Arc<dyn WebSocketConnection>> {
        match self.handle.native()? {
            NativeResource::WebSocket(socket) => Ok(socket),
            NativeResource::SseStream(_) => Err(self.handle.closed_error()),
        }
    }
}

impl fmt::Debug for WebSocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketHandle")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

/// 一条进行中的会话。
#[derive(Clone)]
pub(super) struct WsSession {
    handle: WebSocketHandle,
    behavior: WebSocketBehavior,
}

impl ConnectionManager {
    pub(super) fn on_ws_open(
        &self,
        conn: ConnectionId,
        url: &str,
        socket: Arc<dyn WebSocketConnection>,
    ) {
        let path = url.split('?').next().unwrap_or(url);
        let Some(behavior) = self.router.match_websocket(path) else {
            tracing::warn!(target: "spark_script::connection", %conn, url, "websocket upgrade for unknown endpoint refused");
            socket.close(CLOSE_POLICY_VIOLATION, "no websocket endpoint");
            return;
        };

        let handle = self
            .websockets
            .register(NativeResource::WebSocket(socket));
        let ws = WebSocketHandle::new(handle.clone(), self.websockets.clone());
        self.ws_sessions.insert(
            conn,
            WsSession {
                handle: ws.clone(),
                behavior,
            },
        );
        handle.set_phase(SessionPhase::Open);
        tracing::debug!(target: "spark_script::connection", %conn, id = %handle.id(), "websocket opened");

        if let Some(open) = behavior.open {
            let _ = self
                .bridge
                .invoke("ws.open", open, vec![ScriptValue::WebSocket(ws)]);
        }
    }

    pub(super) fn on_ws_message(&self, conn: ConnectionId, payload: Bytes, opcode: OpCode) {
        let Some(session) = self.ws_sessions.get(&conn).map(|entry| entry.value().clone()) else {
            return;
        };
        if !session.handle.is_open() {
            tracing::trace!(target: "spark_script::connection", %conn, "message after close dropped");
            return;
        }
        if let Some(message) = session.behavior.message {
            let _ = self.bridge.invoke(
                "ws.message",
                message,
                vec![
                    ScriptValue::WebSocket(session.handle),
                    ScriptValue::Bytes(payload),
                    ScriptValue::str(opcode.as_str()),
                ],
            );
        }
    }

    pub(super) fn on_ws_close(&self, conn: ConnectionId, code: u16, reason: &str) {
        let Some((_, session)) = self.ws_sessions.remove(&conn) else {
            return;
        };
        let handle = &session.handle.handle;
        self.websockets.kill(handle);
        if handle.claim_terminal() {
            handle.set_phase(SessionPhase::Closed);
            tracing::debug!(target: "spark_script::connection", %conn, id = %handle.id(), code, "websocket closed");
            if let Some(close) = session.behavior.close {
                let _ = self.bridge.invoke(
                    "ws.close",
                    close,
                    vec![
                        ScriptValue::WebSocket(session.handle.clone()),
                        ScriptValue::Integer(i64::from(code)),
                        ScriptValue::str(reason),
                    ],
                );
            }
        }
        self.websockets.remove(handle.id());
    }

    pub(super) fn quiesce_websockets(&self) -> usize {
        let conns: Vec<ConnectionId> = self.ws_sessions.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for conn in conns {
            let Some((_, session)) = self.ws_sessions.remove(&conn) else {
                continue;
            };
            count += 1;
            let handle = &session.handle.handle;
            handle.claim_terminal();
            if let Some(NativeResource::WebSocket(socket)) = self.websockets.kill(handle) {
                socket.close(CLOSE_GOING_AWAY, "server restarting");
            }
            handle.set_phase(SessionPhase::Closed);
            self.websockets.remove(handle.id());
        }
        count
    }
}
