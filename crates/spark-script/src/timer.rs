//! 定时器引擎：每次循环迭代扫描一次到期定时器。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 脚本通过 `set_timeout`/`set_interval` 注册回调，回调里又可能注册或清除其它定时器；
//! - 因此调用回调期间绝不能持有定时器表锁，同时“清除后不再触发”必须严格成立。
//!
//! ## 逻辑 (How)
//! 1. 持锁收集全部到期且活动的定时器，逐个标记 `firing`，然后放锁；
//! 2. 对每个候选：重新持锁确认仍然 `active`（可能已被同一轮扫描中更早的回调清除），放锁；
//! 3. 无锁调用回调桥；
//! 4. 重新持锁更新状态：重复定时器按 `scheduled_due + interval` 推进，落后超过一整个周期时
//!    重新对齐到 `now + interval`；一次性定时器转为非活动。
//!
//! ## 契约 (What)
//! - 同一 id 同一时刻至多一次触发在途；
//! - `clear` 之后不会再有触发，即使该定时器在本轮扫描中已经到期；
//! - 非活动条目由 [`TimerEngine::sweep`] 回收，并在锁外通过回调桥释放回调与 `Ref` 参数。
//!
//! ## 风险提示 (Trade-offs)
//! - 扫描精度受循环迭代频率约束：迭代稀疏时触发会延后，但不会补发。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bridge::CallbackBridge;
use crate::clock::Clock;
use crate::value::{CallbackRef, ScriptValue};

/// 定时器标识，单调递增，永不复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval,
}

struct TimerEntry {
    callback: CallbackRef,
    args: Vec<ScriptValue>,
    interval: Duration,
    next_due: Instant,
    kind: TimerKind,
    active: bool,
    firing: bool,
}

/// 一次扫描的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub fired: usize,
    pub failed: usize,
}

/// 定时器表。
pub struct TimerEngine {
    table: Mutex<BTreeMap<TimerId, TimerEntry>>,
    next_id: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    bridge: Arc<CallbackBridge>,
}

impl TimerEngine {
    pub fn new(clock: Arc<dyn Clock>, bridge: Arc<CallbackBridge>) -> Self {
        Self::with_ids(clock, bridge, Arc::new(AtomicU64::new(1)))
    }

    /// 与其它引擎共享 id 计数器；热重启前后的应用实例由此得到互不重叠的 id。
    pub fn with_ids(
        clock: Arc<dyn Clock>,
        bridge: Arc<CallbackBridge>,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            next_id,
            clock,
            bridge,
        }
    }

    /// 注册一次性定时器。
    pub fn set_timeout(
        &self,
        callback: CallbackRef,
        delay: Duration,
        args: Vec<ScriptValue>,
    ) -> TimerId {
        self.schedule(TimerKind::Timeout, callback, delay, args)
    }

    /// 注册重复定时器，首次触发在 `interval` 之后。
    pub fn set_interval(
        &self,
        callback: CallbackRef,
        interval: Duration,
        args: Vec<ScriptValue>,
    ) -> TimerId {
        self.schedule(TimerKind::Interval, callback, interval, args)
    }

    pub fn schedule(
        &self,
        kind: TimerKind,
        callback: CallbackRef,
        delay: Duration,
        args: Vec<ScriptValue>,
    ) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = TimerEntry {
            callback,
            args,
            interval: delay,
            next_due: self.clock.now() + delay,
            kind,
            active: true,
            firing: false,
        };
        self.table.lock().insert(id, entry);
        tracing::trace!(target: "spark_script::timer", timer = id.get(), ?kind, ?delay, "timer scheduled");
        id
    }

    /// 停止定时器。未知或已停止的 id 返回 `false`。
    pub fn clear(&self, id: TimerId) -> bool {
        let mut table = self.table.lock();
        match table.get_mut(&id) {
            Some(entry) if entry.active => {
                entry.active = false;
                true
            }
            _ => false,
        }
    }

    /// 触发全部到期定时器。
    pub fn scan(&self) -> ScanReport {
        let now = self.clock.now();
        let due: Vec<(TimerId, CallbackRef, Vec<ScriptValue>, Instant)> = {
            let mut table = self.table.lock();
            table
                .iter_mut()
                .filter(|(_, entry)| entry.active && !entry.firing && entry.next_due <= now)
                .map(|(id, entry)| {
                    entry.firing = true;
                    (*id, entry.callback, entry.args.clone(), entry.next_due)
                })
                .collect()
        };

        let mut report = ScanReport::default();
        for (id, callback, args, scheduled) in due {
            if !self.still_active(id) {
                continue;
            }
            report.fired += 1;
            if self.bridge.invoke("timer", callback, args).is_err() {
                report.failed += 1;
            }
            self.after_fire(id, scheduled, now);
        }
        report
    }

    /// 回收非活动条目并释放其脚本引用，返回回收数量。
    pub fn sweep(&self) -> usize {
        let reclaimed: Vec<TimerEntry> = {
            let mut table = self.table.lock();
            let ids: Vec<TimerId> = table
                .iter()
                .filter(|(_, entry)| !entry.active && !entry.firing)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };
        let count = reclaimed.len();
        for entry in reclaimed {
            self.release(entry);
        }
        count
    }

    /// 停止并释放全部定时器。
    pub fn drain(&self) -> usize {
        let entries = std::mem::take(&mut *self.table.lock());
        let count = entries.len();
        for entry in entries.into_values() {
            self.release(entry);
        }
        count
    }

    /// 最早的活动到期时间。
    pub fn next_deadline(&self) -> Option<Instant> {
        self.table
            .lock()
            .values()
            .filter(|entry| entry.active)
            .map(|entry| entry.next_due)
            .min()
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.table
            .lock()
            .get(&id)
            .is_some_and(|entry| entry.active)
    }

    /// 表中条目总数（含待回收条目）。
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|entry| entry.active)
            .count()
    }

    fn still_active(&self, id: TimerId) -> bool {
        let mut table = self.table.lock();
        match table.get_mut(&id) {
            Some(entry) if entry.active => true,
            Some(entry) => {
                entry.firing = false;
                false
            }
            None => false,
        }
    }

    fn after_fire(&self, id: TimerId, scheduled: Instant, now: Instant) {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(&id) else {
            return;
        };
        entry.firing = false;
        if !entry.active {
            return;
        }
        match entry.kind {
            TimerKind::Timeout => entry.active = false,
            TimerKind::Interval => {
                let next = scheduled + entry.interval;
                entry.next_due = if next <= now {
                    now + entry.interval
                } else {
                    next
                };
            }
        }
    }

    fn release(&self, entry: TimerEntry) {
        self.bridge.release_callback(entry.callback);
        self.bridge.release_args(&entry.args);
    }
}

impl fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEngine")
            .field("entries", &self.len())
            .finish()
    }
}
