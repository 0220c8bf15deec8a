//! 子系统开关位图
//!
//! 每个子系统至多一位，重复 open 幂等。`0 → 非 0` 与 `非 0 → 0` 两条边
//! 是整芯片上下电的触发点，这里只记账并报告沿，动作由启动协调层做。

use spin::Mutex;

use crate::export::{LivenessHint, WcnSubsys, REAL_MASK};

/// open 的记账结果。`first` 表示这次把位图从 0 带到非 0。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOutcome {
    pub prev: u32,
    pub now: u32,
    pub first: bool,
    pub already: bool,
}

/// close 的记账结果。`last` 表示这次把位图带回 0。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseOutcome {
    pub prev: u32,
    pub now: u32,
    pub was_open: bool,
    pub last: bool,
}

/// 位图账本。
pub struct SubsysRefCount {
    bits: Mutex<u32>,
}

impl SubsysRefCount {
    pub fn new() -> Self {
        Self { bits: Mutex::new(0) }
    }

    pub fn bitmap(&self) -> u32 {
        *self.bits.lock()
    }

    pub fn is_open(&self, su: WcnSubsys) -> bool {
        self.bitmap() & su.bits() != 0
    }

    pub fn open(&self, su: WcnSubsys) -> OpenOutcome {
        let mut bits = self.bits.lock();
        let prev = *bits;
        *bits |= su.bits();
        OpenOutcome {
            prev,
            now: *bits,
            first: prev == 0 && *bits != 0,
            already: prev & su.bits() == su.bits(),
        }
    }

    pub fn close(&self, su: WcnSubsys) -> CloseOutcome {
        let mut bits = self.bits.lock();
        let prev = *bits;
        *bits &= !su.bits();
        CloseOutcome {
            prev,
            now: *bits,
            was_open: prev & su.bits() != 0,
            last: prev != 0 && *bits == 0,
        }
    }

    /// 回滚用：清掉所有位。
    pub fn force_clear(&self) -> u32 {
        let mut bits = self.bits.lock();
        let prev = *bits;
        *bits = 0;
        prev
    }
}

impl Default for SubsysRefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// 由位图算存活提示。只看真实子系统位；恰好一个在开返回 `Single`，
/// 全空返回 `Empty`，多于一个没有提示可报。
pub fn liveness(bitmap: u32) -> Option<LivenessHint> {
    let real = bitmap & REAL_MASK;
    if real == 0 {
        return Some(LivenessHint::Empty);
    }
    if real.count_ones() == 1 {
        let su = WcnSubsys::from_bit(real.trailing_zeros())?;
        return Some(LivenessHint::Single(su));
    }
    None
}
