//! 回调桥：原生事件进入脚本解释器的唯一通道。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 解释器同一时刻只允许一个活动调用，但原生引擎可能在多个线程上投递事件；
//! - 脚本错误不能越过事件循环，否则一个坏回调就会拖垮整个进程。
//!
//! ## 逻辑 (How)
//! - 全进程一把可重入锁（`parking_lot::ReentrantMutex`）包住解释器；
//!   同一线程上的嵌套调用（如消息回调里调用 `ws.close()` 同步触发关闭回调）直接重入；
//! - 锁以 RAII 守卫持有，任何返回路径（包括 panic 被捕获后）都会释放；
//! - 解释器返回的错误与解释器内部 panic 都被捕获、记录、计数，并以
//!   [`RuntimeError::ScriptCallback`] 的形式交还调用方。
//!
//! ## 契约 (What)
//! - `invoke` 永远不会 panic，也不会把 panic 向外传播；
//! - 工作线程不直接调用本桥，其完成结果通过队列交给事件循环线程。

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::ReentrantMutex;

use crate::error::{Result, RuntimeError, ScriptError};
use crate::value::{CallbackRef, ScriptRef, ScriptValue};

/// 脚本解释器协作方。
///
/// # 契约 (What)
/// - `call` 同步执行回调并返回全部返回值；
/// - `release_*` 释放运行时持有的引用，之后该引用不会再被使用；
/// - 实现只需要 `Send`：桥通过可重入锁保证同一时刻只有一个线程进入。
pub trait ScriptEngine: Send {
    fn call(
        &self,
        callback: CallbackRef,
        args: Vec<ScriptValue>,
    ) -> core::result::Result<Vec<ScriptValue>, ScriptError>;

    fn release_callback(&self, callback: CallbackRef);

    fn release_value(&self, value: ScriptRef);
}

/// 桥的累计计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub invocations: u64,
    pub failures: u64,
    pub released_callbacks: u64,
}

/// 串行化的回调桥。
pub struct CallbackBridge {
    engine: ReentrantMutex<Box<dyn ScriptEngine>>,
    invocations: AtomicU64,
    failures: AtomicU64,
    released_callbacks: AtomicU64,
}

impl CallbackBridge {
    pub fn new(engine: impl ScriptEngine + 'static) -> Self {
        Self::from_boxed(Box::new(engine))
    }

    pub fn from_boxed(engine: Box<dyn ScriptEngine>) -> Self {
        Self {
            engine: ReentrantMutex::new(engine),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            released_callbacks: AtomicU64::new(0),
        }
    }

    /// 在串行化锁内调用脚本回调。
    ///
    /// `site` 标识触发点（如 `"http.route"`、`"timer"`），只用于日志与错误上下文。
    pub fn invoke(
        &self,
        site: &'static str,
        callback: CallbackRef,
        args: Vec<ScriptValue>,
    ) -> Result<Vec<ScriptValue>> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let outcome = {
            let engine = self.engine.lock();
            catch_unwind(AssertUnwindSafe(|| engine.call(callback, args)))
        };
        let message = match outcome {
            Ok(Ok(values)) => return Ok(values),
            Ok(Err(err)) => err.message().to_owned(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            target: "spark_script::bridge",
            site,
            callback = callback.get(),
            error = %message,
            "script callback failed"
        );
        Err(RuntimeError::ScriptCallback {
            site,
            callback: callback.get(),
            message,
        })
    }

    /// 调用中间件风格的回调：返回 `false` 或失败都视为拒绝。
    pub fn invoke_predicate(
        &self,
        site: &'static str,
        callback: CallbackRef,
        args: Vec<ScriptValue>,
    ) -> Result<bool> {
        let values = self.invoke(site, callback, args)?;
        Ok(!matches!(values.first(), Some(ScriptValue::Bool(false))))
    }

    pub fn release_callback(&self, callback: CallbackRef) {
        self.released_callbacks.fetch_add(1, Ordering::Relaxed);
        let engine = self.engine.lock();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| engine.release_callback(callback)))
        {
            tracing::error!(
                target: "spark_script::bridge",
                callback = callback.get(),
                error = %panic_message(payload.as_ref()),
                "releasing callback panicked"
            );
        }
    }

    pub fn release_value(&self, value: ScriptRef) {
        let engine = self.engine.lock();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| engine.release_value(value))) {
            tracing::error!(
                target: "spark_script::bridge",
                value = value.get(),
                error = %panic_message(payload.as_ref()),
                "releasing value panicked"
            );
        }
    }

    /// 释放参数列表中的全部 `Ref`。
    pub fn release_args(&self, args: &[ScriptValue]) {
        for arg in args {
            if let ScriptValue::Ref(value) = arg {
                self.release_value(*value);
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            released_callbacks: self.released_callbacks.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CallbackBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBridge")
            .field("stats", &self.stats())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "interpreter panicked".to_owned()
    }
}
