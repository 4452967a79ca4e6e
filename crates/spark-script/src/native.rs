//! 原生 I/O 引擎契约。
//!
//! # 教案式说明
//! - **意图（Why）**：HTTP 解析、TCP/TLS 与就绪通知全部由外部原生引擎负责，运行时核心只需要
//!   一组窄接口来写响应、收发 WebSocket 帧、监听端口与驱动事件循环。
//! - **契约（What）**：
//!   - 原生引擎在自己的线程上调用 [`EventSink::deliver`] 投递 [`NativeEvent`]，每次循环迭代结束
//!     后调用 [`EventSink::after_iteration`]；
//!   - 同一连接上的事件按引擎观测顺序投递；不同连接之间无序；
//!   - 携带 body 的请求（POST/PUT/PATCH）总以一次 `last = true` 的 `HttpData` 收尾，空 body 亦然；
//!   - 每个已投递 `WsOpen` 的连接最终都会收到一次 `WsClose`，包括由 `close` 主动发起的关闭；
//!   - 连接被中止后，引擎不再接受针对该连接的任何写入，运行时通过句柄状态保证不再触碰它。
//! - **风险提示（Trade-offs）**：接口全部是同步的，与被桥接的解释器契约一致；背压通过
//!   [`WriteStatus::Full`] 与随后的 [`NativeEvent::HttpWritable`] 表达，而非阻塞等待。

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

/// 原生引擎分配的连接标识，在单个引擎实例内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// 路由层识别的 HTTP 方法。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    /// 大小写不敏感地解析方法名，未知方法返回 `None`。
    pub fn parse(raw: &str) -> Option<Self> {
        let method = match raw.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "PATCH" => HttpMethod::Patch,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            _ => return None,
        };
        Some(method)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 请求元数据的自有拷贝。
///
/// 原生引擎的请求对象只在打开回调期间有效，因此运行时在 `HttpOpen` 时立即复制所需字段，
/// 之后脚本持有的 `req` 永远引用这份拷贝。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: HttpMethod,
    pub url: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub remote_address: String,
    pub params: Vec<(String, String)>,
}

impl RequestInfo {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: String::new(),
            headers: Vec::new(),
            remote_address: String::new(),
            params: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = address.into();
        self
    }

    /// 大小写不敏感地读取首个同名请求头。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// 读取路由参数（`:name` 段）。
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// 代理链路上的客户端地址：取 `X-Forwarded-For` 的第一个条目，缺省回落到对端地址。
    pub fn proxied_remote_address(&self) -> &str {
        self.header("x-forwarded-for")
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty())
            .unwrap_or(&self.remote_address)
    }
}

/// 非阻塞写入的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// 整块数据已被引擎接收。
    Written,
    /// 发送缓冲已满，本块未被接收；调用方需在下一次 `HttpWritable` 时原样重试。
    Full,
}

/// 原生 HTTP 响应。
///
/// # 契约 (What)
/// - 状态行与响应头缓存到第一次被接收的 body 写入或 `end` 为止；在此之前重写状态或同名
///   响应头会替换缓存值，之后再写将被引擎忽略；
/// - `end` 结束响应；若调用方未写 `Content-Length`，由引擎自行分帧；
/// - `close` 立即断开底层连接；
/// - 调用方保证在连接中止或响应结束后不再调用任何方法。
pub trait HttpResponse: Send + Sync {
    fn write_status(&self, status: u16);

    fn write_header(&self, name: &str, value: &str);

    /// 尝试写入一块 body，不阻塞。
    fn try_write(&self, chunk: &[u8]) -> WriteStatus;

    fn end(&self, body: &[u8]);

    fn close(&self);

    fn remote_address(&self) -> String;
}

/// WebSocket 帧类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Text,
    Binary,
}

impl OpCode {
    /// 脚本侧的帧类型名称：`"binary"` 之外一律视为文本。
    pub fn from_script(name: Option<&str>) -> Self {
        match name {
            Some(name) if name.eq_ignore_ascii_case("binary") => OpCode::Binary,
            _ => OpCode::Text,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OpCode::Text => "text",
            OpCode::Binary => "binary",
        }
    }
}

/// WebSocket 发送结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// 帧已排队，但连接处于背压状态。
    Backpressure,
    /// 帧被引擎丢弃（例如超过背压上限）。
    Dropped,
}

/// 原生 WebSocket 连接。
pub trait WebSocketConnection: Send + Sync {
    fn send(&self, payload: &[u8], opcode: OpCode) -> SendStatus;

    /// 发起关闭握手；引擎随后（可能同步）投递 `WsClose`。
    fn close(&self, code: u16, reason: &str);

    fn remote_address(&self) -> String;
}

/// 已绑定的监听套接字。
pub trait ListenSocket: Send + Sync {
    fn port(&self) -> u16;

    /// 停止接受新连接；已建立的连接不受影响。
    fn close(&self);
}

/// 原生引擎投递给运行时的事件。
#[derive(Clone)]
pub enum NativeEvent {
    HttpOpen {
        conn: ConnectionId,
        request: RequestInfo,
        response: Arc<dyn HttpResponse>,
    },
    HttpData {
        conn: ConnectionId,
        chunk: Bytes,
        last: bool,
    },
    /// 发送缓冲重新可写。
    HttpWritable { conn: ConnectionId },
    /// 对端断开或引擎放弃该请求。
    HttpAborted { conn: ConnectionId },
    WsOpen {
        conn: ConnectionId,
        url: String,
        socket: Arc<dyn WebSocketConnection>,
    },
    WsMessage {
        conn: ConnectionId,
        payload: Bytes,
        opcode: OpCode,
    },
    WsClose {
        conn: ConnectionId,
        code: u16,
        reason: String,
    },
}

impl NativeEvent {
    pub fn conn(&self) -> ConnectionId {
        match self {
            NativeEvent::HttpOpen { conn, .. }
            | NativeEvent::HttpData { conn, .. }
            | NativeEvent::HttpWritable { conn }
            | NativeEvent::HttpAborted { conn }
            | NativeEvent::WsOpen { conn, .. }
            | NativeEvent::WsMessage { conn, .. }
            | NativeEvent::WsClose { conn, .. } => *conn,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NativeEvent::HttpOpen { .. } => "http.open",
            NativeEvent::HttpData { .. } => "http.data",
            NativeEvent::HttpWritable { .. } => "http.writable",
            NativeEvent::HttpAborted { .. } => "http.aborted",
            NativeEvent::WsOpen { .. } => "ws.open",
            NativeEvent::WsMessage { .. } => "ws.message",
            NativeEvent::WsClose { .. } => "ws.close",
        }
    }
}

impl fmt::Debug for NativeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEvent")
            .field("kind", &self.kind())
            .field("conn", &self.conn())
            .finish()
    }
}

/// 运行时暴露给原生引擎的事件入口。
pub trait EventSink {
    fn deliver(&self, event: NativeEvent);

    /// 每次循环迭代结束后调用：驱动定时器、传输截止、工作线程完成队列与挂起的热重启。
    fn after_iteration(&self);
}

/// 原生 I/O 引擎。
pub trait NativeEngine: Send + Sync {
    fn listen(&self, port: u16) -> io::Result<Arc<dyn ListenSocket>>;

    /// 在调用线程上运行事件循环，直到 [`NativeEngine::stop`] 被调用。
    fn run(&self, sink: &dyn EventSink);

    fn stop(&self);

    /// 唤醒阻塞在就绪等待中的事件循环，使其尽快执行一次 `after_iteration`。
    fn wake(&self) {}
}
