//! 内存模拟总线
//!
//! 用两张 `BTreeMap` 模拟芯片的寄存器空间与 RAM，并为每次总线操作记一条
//! 流水账，测试可据此断言操作的种类、地址与先后次序。支持两种故障注入：
//! 限定 `direct_write` 成功次数（之后返回 `-EIO`），以及给每次 `direct_write`
//! 加固定延迟（用于制造下载超时）。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use spin::Mutex;

use crate::{CardDetectCb, WcnBus, EBUSY, EIO, ENODEV};

/// 一条总线操作记录。读写各记地址；`direct_*` 另记长度。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusOp {
    Register,
    Unregister,
    Rescan,
    RemoveCard,
    RegRead(u32),
    RegWrite(u32, u32),
    DirectRead { addr: u32, len: usize },
    DirectWrite { addr: u32, len: usize },
}

/// 内存模拟总线。
pub struct MemBus {
    regs: Mutex<BTreeMap<u32, u32>>,
    ram: Mutex<BTreeMap<u32, u8>>,
    journal: Mutex<Vec<BusOp>>,
    card_cb: Mutex<Option<CardDetectCb>>,
    registered: AtomicBool,
    /// rescan 时同步回调卡检测（默认开）。关掉可制造检卡超时。
    auto_detect: AtomicBool,
    /// 剩余允许成功的 direct_write 次数；`u64::MAX` 表示不限。
    write_budget: AtomicU64,
    write_delay_ms: AtomicU64,
}

impl MemBus {
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(BTreeMap::new()),
            ram: Mutex::new(BTreeMap::new()),
            journal: Mutex::new(Vec::new()),
            card_cb: Mutex::new(None),
            registered: AtomicBool::new(false),
            auto_detect: AtomicBool::new(true),
            write_budget: AtomicU64::new(u64::MAX),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// 预置寄存器值（不记流水账），用于摆好状态寄存器再跑被测代码。
    pub fn preset_reg(&self, addr: u32, val: u32) {
        self.regs.lock().insert(addr, val);
    }

    /// 直接读寄存器当前值（不记流水账）。
    pub fn peek_reg(&self, addr: u32) -> u32 {
        self.regs.lock().get(&addr).copied().unwrap_or(0)
    }

    /// 读 RAM 当前内容（不记流水账），未写过的字节为 0。
    pub fn peek_ram(&self, addr: u32, len: usize) -> Vec<u8> {
        let ram = self.ram.lock();
        (0..len)
            .map(|i| ram.get(&(addr + i as u32)).copied().unwrap_or(0))
            .collect()
    }

    /// 预置 RAM 内容（不记流水账）。
    pub fn preset_ram(&self, addr: u32, data: &[u8]) {
        let mut ram = self.ram.lock();
        for (i, b) in data.iter().enumerate() {
            ram.insert(addr + i as u32, *b);
        }
    }

    pub fn set_auto_card_detect(&self, on: bool) {
        self.auto_detect.store(on, Ordering::Relaxed);
    }

    /// 手动触发一次卡检测回调（auto_detect 关闭时由测试自行调度）。
    pub fn trigger_card_detect(&self) {
        if let Some(cb) = &*self.card_cb.lock() {
            cb();
        }
    }

    /// 之后的第 `n + 1` 次 `direct_write` 开始返回 `-EIO`。
    pub fn fail_direct_write_after(&self, n: u64) {
        self.write_budget.store(n, Ordering::Relaxed);
    }

    /// 每次 `direct_write` 固定睡 `ms` 毫秒。
    pub fn set_direct_write_delay_ms(&self, ms: u64) {
        self.write_delay_ms.store(ms, Ordering::Relaxed);
    }

    pub fn journal(&self) -> Vec<BusOp> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    fn record(&self, op: BusOp) {
        self.journal.lock().push(op);
    }
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl WcnBus for MemBus {
    fn register(&self, on_card_detect: CardDetectCb) -> Result<(), i32> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(EBUSY);
        }
        *self.card_cb.lock() = Some(on_card_detect);
        self.record(BusOp::Register);
        Ok(())
    }

    fn unregister(&self) {
        self.registered.store(false, Ordering::SeqCst);
        *self.card_cb.lock() = None;
        self.record(BusOp::Unregister);
    }

    fn rescan(&self) -> Result<(), i32> {
        if !self.registered.load(Ordering::SeqCst) {
            return Err(ENODEV);
        }
        self.record(BusOp::Rescan);
        if self.auto_detect.load(Ordering::Relaxed) {
            self.trigger_card_detect();
        }
        Ok(())
    }

    fn remove_card(&self) {
        self.record(BusOp::RemoveCard);
    }

    fn reg_read(&self, addr: u32) -> Result<u32, i32> {
        self.record(BusOp::RegRead(addr));
        Ok(self.regs.lock().get(&addr).copied().unwrap_or(0))
    }

    fn reg_write(&self, addr: u32, val: u32) -> Result<(), i32> {
        self.record(BusOp::RegWrite(addr, val));
        self.regs.lock().insert(addr, val);
        Ok(())
    }

    fn direct_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), i32> {
        self.record(BusOp::DirectRead {
            addr,
            len: buf.len(),
        });
        let ram = self.ram.lock();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = ram.get(&(addr + i as u32)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn direct_write(&self, addr: u32, data: &[u8]) -> Result<(), i32> {
        let delay = self.write_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let budget = self.write_budget.load(Ordering::Relaxed);
        if budget != u64::MAX {
            if budget == 0 {
                return Err(EIO);
            }
            self.write_budget.store(budget - 1, Ordering::Relaxed);
        }
        self.record(BusOp::DirectWrite {
            addr,
            len: data.len(),
        });
        let mut ram = self.ram.lock();
        for (i, b) in data.iter().enumerate() {
            ram.insert(addr + i as u32, *b);
        }
        Ok(())
    }
}
