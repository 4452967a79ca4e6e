//! 连接生命周期管理：把原生事件翻译为脚本回调，并维护每类连接的状态机。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - HTTP 交换、WebSocket 会话、SSE 流各有自己的终态规则，但都必须满足“终态恰好一次”
//!   与“中止后不再触碰原生资源”；
//! - 把这些规则集中在一个管理器里，原生引擎只需按连接 id 投递事件。
//!
//! ## 逻辑 (How)
//! - 三张 `DashMap` 分别记录进行中的 HTTP 交换、WebSocket 会话与 SSE 流；
//! - 调用脚本前总是先把条目克隆出表（释放分片锁），回调里对同一张表的增删不会死锁；
//! - 中止事件通过 `DashMap::remove` 认领，天然只有一次成功。
//!
//! ## 契约 (What)
//! - [`ConnectionManager::handle`] 是原生事件的唯一入口；
//! - [`ConnectionManager::quiesce`] 按“结束 SSE → 关闭 WebSocket → 中止传输 → 关闭未完成交换”
//!   的顺序终止全部连接，不调用任何脚本回调。

pub mod http;
pub mod sse;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::bridge::CallbackBridge;
use crate::native::{ConnectionId, NativeEvent};
use crate::registry::{HandleId, HandleRegistry};
use crate::router::Router;
use crate::transfer::TransferEngine;

use self::http::HttpExchange;
use self::sse::SseStream;
use self::websocket::WsSession;

/// 终止全部连接后的统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuiesceReport {
    pub sse_streams: usize,
    pub websockets: usize,
    pub transfers: usize,
    pub exchanges: usize,
}

/// 连接生命周期管理器。
pub struct ConnectionManager {
    bridge: Arc<CallbackBridge>,
    router: Arc<Router>,
    transfers: Arc<TransferEngine>,
    websockets: Arc<HandleRegistry>,
    streams: Arc<HandleRegistry>,
    exchanges: Arc<DashMap<ConnectionId, Arc<HttpExchange>>>,
    ws_sessions: DashMap<ConnectionId, WsSession>,
    sse_streams: DashMap<HandleId, SseStream>,
    sse_conns: DashMap<ConnectionId, HandleId>,
    sse_backlog_limit: usize,
}

impl ConnectionManager {
    pub fn new(
        bridge: Arc<CallbackBridge>,
        router: Arc<Router>,
        transfers: Arc<TransferEngine>,
        websockets: Arc<HandleRegistry>,
        streams: Arc<HandleRegistry>,
        sse_backlog_limit: usize,
    ) -> Self {
        Self {
            bridge,
            router,
            transfers,
            websockets,
            streams,
            exchanges: Arc::new(DashMap::new()),
            ws_sessions: DashMap::new(),
            sse_streams: DashMap::new(),
            sse_conns: DashMap::new(),
            sse_backlog_limit: sse_backlog_limit.max(1),
        }
    }

    /// 原生事件入口。
    pub fn handle(&self, event: NativeEvent) {
        tracing::trace!(target: "spark_script::connection", conn = %event.conn(), kind = event.kind(), "native event");
        match event {
            NativeEvent::HttpOpen {
                conn,
                request,
                response,
            } => self.on_http_open(conn, request, response),
            NativeEvent::HttpData { conn, chunk, last } => self.on_http_data(conn, chunk, last),
            NativeEvent::HttpWritable { conn } => {
                if !self.transfers.on_writable(conn) {
                    self.flush_stream(conn);
                }
            }
            NativeEvent::HttpAborted { conn } => self.on_http_aborted(conn),
            NativeEvent::WsOpen { conn, url, socket } => self.on_ws_open(conn, &url, socket),
            NativeEvent::WsMessage {
                conn,
                payload,
                opcode,
            } => self.on_ws_message(conn, payload, opcode),
            NativeEvent::WsClose { conn, code, reason } => self.on_ws_close(conn, code, &reason),
        }
    }

    /// 进行中的 HTTP 交换数量（响应尚未结束）。
    pub fn open_exchanges(&self) -> usize {
        self.exchanges.len()
    }

    pub fn open_websockets(&self) -> usize {
        self.ws_sessions.len()
    }

    pub fn open_streams(&self) -> usize {
        self.sse_streams.len()
    }

    /// 终止全部连接。
    pub fn quiesce(&self) -> QuiesceReport {
        let sse_streams = self.quiesce_streams();
        let websockets = self.quiesce_websockets();
        let transfers = self.transfers.abort_all();

        let conns: Vec<ConnectionId> = self.exchanges.iter().map(|entry| *entry.key()).collect();
        let mut exchanges = 0;
        for conn in conns {
            if let Some((_, exchange)) = self.exchanges.remove(&conn) {
                exchanges += 1;
                exchange.shutdown();
            }
        }
        QuiesceReport {
            sse_streams,
            websockets,
            transfers,
            exchanges,
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("exchanges", &self.exchanges.len())
            .field("websockets", &self.ws_sessions.len())
            .field("sse_streams", &self.sse_streams.len())
            .finish()
    }
}
