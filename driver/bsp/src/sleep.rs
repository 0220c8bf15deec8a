//! 休眠与唤醒握手
//!
//! 芯片空闲自动进深睡，任何寄存器/内存访问前必须先醒。本模块维护一张
//! 唤醒源活跃位图：有位在上就压着不许睡，最后一位撤掉才写允睡位。
//!
//! 唤醒是慢握手（写唤醒位后轮询状态码，晶振/PLL 要几十毫秒），用一把
//! 慢路径互斥串行化；快路径只查状态位图，已醒时一次锁都不多拿。

use std::sync::Mutex as StdMutex;

use bus::{BusRegister, SharedBus};

use crate::chip::ChipProfile;
use crate::error::{WcnError, WcnResult};
use crate::export::{SleepStatus, SleepTimeoutPolicy, WcnSubsys};
use crate::sync::{delay_ms, plock, CancelToken};

/// 唤醒源。子系统之外，电域操作与启动流程也会短暂压醒芯片。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeSource {
    Subsys(WcnSubsys),
    MemPd,
    Boot,
}

impl WakeSource {
    const fn bits(self) -> u32 {
        match self {
            WakeSource::Subsys(su) => su.bits(),
            WakeSource::MemPd => 1 << 8,
            WakeSource::Boot => 1 << 9,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            WakeSource::Subsys(su) => su.name(),
            WakeSource::MemPd => "mem_pd",
            WakeSource::Boot => "boot",
        }
    }
}

/// 休眠/唤醒管理。
pub struct SleepWakeManager {
    bus: SharedBus,
    profile: &'static ChipProfile,
    policy: SleepTimeoutPolicy,
    cancel: CancelToken,
    /// 活跃唤醒源位图。
    active: spin::Mutex<u32>,
    /// 宿主视角的芯片状态。
    status: spin::Mutex<SleepStatus>,
    /// 慢路径握手互斥。
    handshake: StdMutex<()>,
}

impl SleepWakeManager {
    pub fn new(
        bus: SharedBus,
        profile: &'static ChipProfile,
        policy: SleepTimeoutPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            bus,
            profile,
            policy,
            cancel,
            active: spin::Mutex::new(0),
            status: spin::Mutex::new(SleepStatus::Awake),
            handshake: StdMutex::new(()),
        }
    }

    pub fn status(&self) -> SleepStatus {
        *self.status.lock()
    }

    pub fn active_sources(&self) -> u32 {
        *self.active.lock()
    }

    /// 芯片重新上电后回到初始态：无活跃源、醒着。
    pub fn reset(&self) {
        *self.active.lock() = 0;
        *self.status.lock() = SleepStatus::Awake;
    }

    /// 把 `src` 记为活跃并确保芯片已醒。已醒时只置位即返回。
    pub fn ensure_awake(&self, src: WakeSource) -> WcnResult<()> {
        *self.active.lock() |= src.bits();
        if *self.status.lock() == SleepStatus::Awake {
            return Ok(());
        }

        let _hs = plock(&self.handshake);
        // 排队期间别人可能已经握完手
        if *self.status.lock() == SleepStatus::Awake {
            return Ok(());
        }
        *self.status.lock() = SleepStatus::Waking;
        log::debug!(target: "wcn::bsp::slp", "wake request by {}", src.name());

        let wakeup = BusRegister::new(self.bus.clone(), self.profile.wakeup_reg);
        if let Err(errno) = wakeup.set_bits(self.profile.wakeup_bit) {
            *self.status.lock() = SleepStatus::Asleep;
            return Err(WcnError::from_errno(errno));
        }

        let retries = self.profile.wake_poll_retries;
        for attempt in 1..=retries {
            if self.cancel.is_cancelled() {
                *self.status.lock() = SleepStatus::Asleep;
                return Err(WcnError::Cancelled);
            }
            match self.bus.reg_read(self.profile.slp_sts_reg) {
                Ok(v) => {
                    let code = v & self.profile.slp_sts_mask;
                    if code == self.profile.slp_awake_code {
                        *self.status.lock() = SleepStatus::Awake;
                        log::debug!(
                            target: "wcn::bsp::slp",
                            "chip awake after {} polls",
                            attempt
                        );
                        return Ok(());
                    }
                    if self.profile.slp_waking_codes.contains(&code) {
                        log::trace!(target: "wcn::bsp::slp", "still waking (0x{:02x})", code);
                    } else {
                        log::trace!(target: "wcn::bsp::slp", "sleep status 0x{:02x}", code);
                    }
                }
                Err(errno) => {
                    log::warn!(
                        target: "wcn::bsp::slp",
                        "sleep status read failed (errno {})",
                        errno
                    );
                }
            }
            if attempt < retries {
                delay_ms(self.profile.wake_poll_interval_ms);
            }
        }

        match self.policy {
            SleepTimeoutPolicy::AssumeAwake => {
                // 部分批次醒了也不回状态字，按醒处理并留痕
                *self.status.lock() = SleepStatus::Awake;
                log::warn!(
                    target: "wcn::bsp::slp",
                    "wake handshake exhausted {} polls, assume awake",
                    retries
                );
                Ok(())
            }
            SleepTimeoutPolicy::Strict => {
                *self.status.lock() = SleepStatus::Asleep;
                log::error!(
                    target: "wcn::bsp::slp",
                    "wake handshake exhausted {} polls",
                    retries
                );
                Err(WcnError::SleepWakeTimeout)
            }
        }
    }

    /// 撤掉 `src` 的活跃位；没有剩余活跃源时写允睡位放芯片入睡。
    pub fn allow_sleep(&self, src: WakeSource) -> WcnResult<()> {
        {
            let mut active = self.active.lock();
            *active &= !src.bits();
            if *active != 0 {
                return Ok(());
            }
        }
        let _hs = plock(&self.handshake);
        // 排队期间可能有新唤醒源进来
        if *self.active.lock() != 0 {
            return Ok(());
        }
        if *self.status.lock() == SleepStatus::Asleep {
            return Ok(());
        }
        let ctl = BusRegister::new(self.bus.clone(), self.profile.slp_ctl_reg);
        if let Err(errno) = ctl.set_bits(self.profile.slp_allow_bits) {
            log::error!(
                target: "wcn::bsp::slp",
                "sleep permit write failed (errno {})",
                errno
            );
            return Err(WcnError::from_errno(errno));
        }
        *self.status.lock() = SleepStatus::Asleep;
        log::debug!(target: "wcn::bsp::slp", "no active wake source, sleep permitted");
        Ok(())
    }
}
