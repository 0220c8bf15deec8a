//! 同步原语
//!
//! - [`Completion`]：一次性完成量。等待方带超时与取消令牌阻塞，完成方
//!   单次投递一个值；`reset` 后可开始下一轮。
//! - [`CancelToken`]：拆除用的协作取消令牌，所有有界等待都要看它。
//!
//! 等待内部按小步片轮询条件变量，取消最迟一个步片内生效，不依赖完成方
//! 补一次唤醒。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// 取锁并摘掉毒标记。持锁代码不会把受保护数据留在半程状态，染毒只可能
/// 来自测试里的断言 panic。
pub(crate) fn plock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 睡眠 `ms` 毫秒。
#[inline]
pub fn delay_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// 协作取消令牌。克隆共享同一标志，置位后不可复位。
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// 有界等待的失败方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Cancelled,
}

struct Slot<T> {
    value: Option<T>,
    done: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// 一次性完成量。值被恰好一个等待方取走，其余等待方按超时退出。
pub struct Completion<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 取消检查的最大步片。
const CANCEL_SLICE: Duration = Duration::from_millis(20);

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    value: None,
                    done: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// 投递完成值并唤醒等待方。本轮内只有第一次投递生效。
    pub fn complete(&self, value: T) {
        let mut slot = plock(&self.inner.slot);
        if slot.done {
            log::debug!(target: "wcn::bsp", "completion already satisfied, drop value");
            return;
        }
        slot.value = Some(value);
        slot.done = true;
        self.inner.cond.notify_all();
    }

    /// 是否已有投递（值可能已被取走）。
    pub fn is_done(&self) -> bool {
        plock(&self.inner.slot).done
    }

    /// 清空本轮投递，开始下一轮。
    pub fn reset(&self) {
        let mut slot = plock(&self.inner.slot);
        slot.value = None;
        slot.done = false;
    }

    /// 等待完成值，最多 `timeout`，期间观察取消令牌。
    pub fn wait_for(&self, timeout: Duration, cancel: &CancelToken) -> Result<T, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut slot = plock(&self.inner.slot);
        loop {
            if let Some(v) = slot.value.take() {
                return Ok(v);
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            let step = (deadline - now).min(CANCEL_SLICE);
            let (g, _) = self
                .inner
                .cond
                .wait_timeout(slot, step)
                .unwrap_or_else(PoisonError::into_inner);
            slot = g;
        }
    }
}
