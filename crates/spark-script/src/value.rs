//! 跨越回调桥的脚本值模型。
//!
//! # 教案式说明
//! - **意图（Why）**：解释器与运行时之间只交换同步值；原生缓冲在进入脚本前一律转成
//!   [`Bytes`]，不暴露任何原生指针。
//! - **契约（What）**：
//!   - [`CallbackRef`]/[`ScriptRef`] 是解释器注册表中的不透明引用，运行时持有期间负责在
//!     生命周期结束时通过桥释放；
//!   - `Request`/`Response`/`WebSocket` 变体携带运行时句柄，解释器把它们包装成脚本对象；
//!   - 句柄变体按身份比较，其余变体按值比较。

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::websocket::WebSocketHandle;
use crate::native::RequestInfo;
use crate::response::ResponseHandle;

/// 解释器中保留的函数引用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackRef(u64);

impl CallbackRef {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// 解释器中保留的任意值引用（表、userdata 等）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptRef(u64);

impl ScriptRef {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// 桥上传递的值。
#[derive(Clone, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Str(Arc<str>),
    Bytes(Bytes),
    Ref(ScriptRef),
    Request(Arc<RequestInfo>),
    Response(ResponseHandle),
    WebSocket(WebSocketHandle),
}

impl ScriptValue {
    pub fn str(value: impl AsRef<str>) -> Self {
        ScriptValue::Str(Arc::from(value.as_ref()))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScriptValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(value) => Some(&**value),
            _ => None,
        }
    }

    /// 文本与字节串都可以按字节读取。
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ScriptValue::Bytes(value) => Some(&value[..]),
            ScriptValue::Str(value) => Some(value.as_bytes()),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&Arc<RequestInfo>> {
        match self {
            ScriptValue::Request(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseHandle> {
        match self {
            ScriptValue::Response(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_websocket(&self) -> Option<&WebSocketHandle> {
        match self {
            ScriptValue::WebSocket(value) => Some(value),
            _ => None,
        }
    }

    /// 脚本真值：只有 `nil` 与 `false` 为假。
    pub fn is_truthy(&self) -> bool {
        !matches!(self, ScriptValue::Nil | ScriptValue::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Integer(_) | ScriptValue::Number(_) => "number",
            ScriptValue::Str(_) | ScriptValue::Bytes(_) => "string",
            ScriptValue::Ref(_) => "ref",
            ScriptValue::Request(_) => "request",
            ScriptValue::Response(_) => "response",
            ScriptValue::WebSocket(_) => "websocket",
        }
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Nil, ScriptValue::Nil) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Integer(a), ScriptValue::Integer(b)) => a == b,
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
            (ScriptValue::Str(a), ScriptValue::Str(b)) => a == b,
            (ScriptValue::Bytes(a), ScriptValue::Bytes(b)) => a == b,
            (ScriptValue::Ref(a), ScriptValue::Ref(b)) => a == b,
            (ScriptValue::Request(a), ScriptValue::Request(b)) => Arc::ptr_eq(a, b),
            (ScriptValue::Response(a), ScriptValue::Response(b)) => a.same_as(b),
            (ScriptValue::WebSocket(a), ScriptValue::WebSocket(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => f.write_str("nil"),
            ScriptValue::Bool(value) => write!(f, "{value}"),
            ScriptValue::Integer(value) => write!(f, "{value}"),
            ScriptValue::Number(value) => write!(f, "{value}"),
            ScriptValue::Str(value) => write!(f, "{value:?}"),
            ScriptValue::Bytes(value) => write!(f, "bytes[{}]", value.len()),
            ScriptValue::Ref(value) => write!(f, "ref#{}", value.get()),
            ScriptValue::Request(req) => write!(f, "request({} {})", req.method, req.url),
            ScriptValue::Response(res) => write!(f, "response({})", res.conn()),
            ScriptValue::WebSocket(ws) => write!(f, "websocket({})", ws.id()),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Integer(value)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Number(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::str(value)
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::Str(Arc::from(value))
    }
}

impl From<Bytes> for ScriptValue {
    fn from(value: Bytes) -> Self {
        ScriptValue::Bytes(value)
    }
}

impl From<Vec<u8>> for ScriptValue {
    fn from(value: Vec<u8>) -> Self {
        ScriptValue::Bytes(Bytes::from(value))
    }
}

impl From<ScriptRef> for ScriptValue {
    fn from(value: ScriptRef) -> Self {
        ScriptValue::Ref(value)
    }
}
