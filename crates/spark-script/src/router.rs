//! 路由表：方法 + 路径模式 → 目标，以及全局/按模式作用域的中间件链。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 原生事件线程在每个请求上读取路由表，脚本线程（以及热重启的重新注册入口）写入路由表；
//! - 读路径不应被写路径阻塞，因此沿用“整表快照 + 原子替换”的做法。
//!
//! ## 逻辑 (How)
//! - [`Router`] 以 `ArcSwap<RouteTable>` 持有快照；注册通过 `rcu` 克隆旧表、追加条目、替换；
//! - 路径模式支持字面段、`:name` 参数段与末尾 `*` 通配段；
//! - 按注册顺序匹配，先注册者优先。
//!
//! ## 契约 (What)
//! - [`Router::match_http`] 返回目标、模式原文、参数与适用的中间件（按注册顺序）；
//! - 中间件作用域以模式原文精确比较，`None` 表示全局；
//! - [`Router::clear`] 清空整表并交还全部回调引用，由调用方统一释放。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;

use crate::native::HttpMethod;
use crate::static_files::StaticMount;
use crate::value::CallbackRef;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// 已解析的路径模式。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePattern {
    source: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(source: &str) -> Self {
        let raw: Vec<&str> = split_path(source).collect();
        let last = raw.len().saturating_sub(1);
        let segments = raw
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                if *segment == "*" && index == last {
                    Segment::Wildcard
                } else if let Some(name) = segment.strip_prefix(':') {
                    Segment::Param(name.to_owned())
                } else {
                    Segment::Literal((*segment).to_owned())
                }
            })
            .collect();
        Self {
            source: source.to_owned(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 匹配成功时返回捕获的参数。
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let mut params = Vec::new();
        let mut parts = split_path(path);
        for segment in &self.segments {
            match segment {
                Segment::Wildcard => return Some(params),
                Segment::Literal(expected) => {
                    if parts.next()? != expected.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.push((name.clone(), parts.next()?.to_owned()));
                }
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// 路由的方法约束。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodFilter {
    Any,
    Only(HttpMethod),
}

impl MethodFilter {
    fn accepts(self, method: HttpMethod) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Only(expected) => expected == method,
        }
    }
}

/// WebSocket 端点的回调集合。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WebSocketBehavior {
    pub open: Option<CallbackRef>,
    pub message: Option<CallbackRef>,
    pub close: Option<CallbackRef>,
}

impl WebSocketBehavior {
    fn callbacks(&self) -> impl Iterator<Item = CallbackRef> {
        [self.open, self.message, self.close].into_iter().flatten()
    }
}

/// SSE 端点的回调集合。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SseBehavior {
    /// `open(stream_id, req)`。
    pub open: CallbackRef,
    /// `close(stream_id)`，在流终止时恰好调用一次。
    pub close: Option<CallbackRef>,
}

/// HTTP 路由目标。
#[derive(Clone, Debug)]
pub enum RouteTarget {
    Handler(CallbackRef),
    Sse(SseBehavior),
    Static(Arc<StaticMount>),
}

impl RouteTarget {
    fn callbacks(&self) -> Vec<CallbackRef> {
        match self {
            RouteTarget::Handler(callback) => vec![*callback],
            RouteTarget::Sse(behavior) => std::iter::once(behavior.open)
                .chain(behavior.close)
                .collect(),
            RouteTarget::Static(_) => Vec::new(),
        }
    }
}

#[derive(Debug)]
struct HttpRoute {
    method: MethodFilter,
    pattern: RoutePattern,
    target: RouteTarget,
}

#[derive(Debug)]
struct WebSocketRoute {
    pattern: RoutePattern,
    behavior: WebSocketBehavior,
}

#[derive(Clone, Debug)]
struct Middleware {
    callback: CallbackRef,
    scope: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct RouteTable {
    http: Vec<Arc<HttpRoute>>,
    websockets: Vec<Arc<WebSocketRoute>>,
    middleware: Vec<Middleware>,
}

/// 一次 HTTP 匹配结果。
#[derive(Clone, Debug)]
pub struct RouteMatch {
    pub target: RouteTarget,
    pub pattern: String,
    pub params: Vec<(String, String)>,
    pub middleware: Vec<CallbackRef>,
}

/// 可热替换的路由表。
pub struct Router {
    table: ArcSwap<RouteTable>,
    revision: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            revision: AtomicU64::new(0),
        }
    }

    pub fn add_route(&self, method: MethodFilter, pattern: &str, target: RouteTarget) {
        let route = Arc::new(HttpRoute {
            method,
            pattern: RoutePattern::parse(pattern),
            target,
        });
        self.table.rcu(|table| {
            let mut next = RouteTable::clone(table);
            next.http.push(route.clone());
            next
        });
        self.bump();
    }

    pub fn add_websocket(&self, pattern: &str, behavior: WebSocketBehavior) {
        let route = Arc::new(WebSocketRoute {
            pattern: RoutePattern::parse(pattern),
            behavior,
        });
        self.table.rcu(|table| {
            let mut next = RouteTable::clone(table);
            next.websockets.push(route.clone());
            next
        });
        self.bump();
    }

    /// 注册中间件；`scope` 为 `None` 时对全部请求生效。
    pub fn add_middleware(&self, callback: CallbackRef, scope: Option<&str>) {
        let middleware = Middleware {
            callback,
            scope: scope.map(str::to_owned),
        };
        self.table.rcu(|table| {
            let mut next = RouteTable::clone(table);
            next.middleware.push(middleware.clone());
            next
        });
        self.bump();
    }

    pub fn match_http(&self, method: HttpMethod, path: &str) -> Option<RouteMatch> {
        let table = self.table.load();
        table.http.iter().find_map(|route| {
            if !route.method.accepts(method) {
                return None;
            }
            let params = route.pattern.matches(path)?;
            Some(RouteMatch {
                target: route.target.clone(),
                pattern: route.pattern.as_str().to_owned(),
                params,
                middleware: scoped_middleware(&table.middleware, route.pattern.as_str()),
            })
        })
    }

    pub fn match_websocket(&self, path: &str) -> Option<WebSocketBehavior> {
        let table = self.table.load();
        table
            .websockets
            .iter()
            .find(|route| route.pattern.matches(path).is_some())
            .map(|route| route.behavior)
    }

    /// 注册修订号，每次变更递增。
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn route_count(&self) -> usize {
        let table = self.table.load();
        table.http.len() + table.websockets.len()
    }

    /// 清空路由表并交还所有回调引用。
    pub fn clear(&self) -> Vec<CallbackRef> {
        let previous = self.table.swap(Arc::new(RouteTable::default()));
        self.bump();
        let mut callbacks: Vec<CallbackRef> = previous
            .http
            .iter()
            .flat_map(|route| route.target.callbacks())
            .collect();
        callbacks.extend(
            previous
                .websockets
                .iter()
                .flat_map(|route| route.behavior.callbacks()),
        );
        callbacks.extend(previous.middleware.iter().map(|mw| mw.callback));
        callbacks
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("revision", &self.revision())
            .field("routes", &self.route_count())
            .finish()
    }
}

fn scoped_middleware(chain: &[Middleware], pattern: &str) -> Vec<CallbackRef> {
    chain
        .iter()
        .filter(|mw| mw.scope.as_deref().is_none_or(|scope| scope == pattern))
        .map(|mw| mw.callback)
        .collect()
}
