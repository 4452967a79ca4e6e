//! 可注入的单调时钟。
//!
//! # 教案式说明
//! - **意图（Why）**：定时器扫描与传输截止时间都依赖“当前时间”；直接读取系统时钟会让
//!   “50ms 间隔在 220ms 内恰好触发 4 次”这类断言无法复现。
//! - **契约（What）**：[`Clock::now`] 必须单调不减；生产环境使用 [`SystemClock`]，测试注入
//!   [`ManualClock`] 并通过 [`ManualClock::advance`] 推进虚拟时间。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 统一的时间来源。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;
}

/// 委托给 [`Instant::now`] 的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的虚拟时钟。
///
/// # 契约 (What)
/// - 克隆体共享同一时间轴，测试可以把一份交给运行时、另一份留在用例中推进；
/// - `advance` 只会向前移动，不存在回拨。
#[derive(Clone, Debug)]
pub struct ManualClock {
    inner: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// 以当前系统时间为起点创建虚拟时钟。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, delta: Duration) {
        let mut now = self.inner.lock();
        *now += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.inner.lock()
    }
}
