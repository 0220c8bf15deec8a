//! 启动协调
//!
//! 芯片生命周期的总调度：冷启动（上电 → 就绪会合 → GNSS 固件 → BTWF
//! 固件 → 就绪）、单核补启、关断与失败回滚。GNSS 先于 BTWF 是硬约束，
//! BTWF 起来就要立刻进校准，GNSS 侧寄存器必须已就位。
//!
//! 所有状态迁移都在一把机器互斥下进行；固件下载交给工码线程，等待期间
//! 互斥放开，bitmap 查询和事件回调不会被十秒级的下载压住。进入流程的
//! 线程先等机器离开过渡态，再看自己还需不需要动作。
//!
//! 超时是致命的：任何一步下载在限期内没有回音，整芯片下电、位图清零、
//! 状态落在 `Failed`，用事件把坏消息送出去。

use std::sync::{Arc, Condvar, Mutex as StdMutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bus::{BusRegister, SharedBus};

use crate::chip::ChipProfile;
use crate::error::{WcnError, WcnResult};
use crate::export::{
    CpCore, WcnConfig, WcnEvent, WcnSubsys, AUTO_MASK, GNSS_MASK, REAL_MASK,
};
use crate::fw_load::FirmwareLoader;
use crate::mem_pd::MemPdManager;
use crate::power::PowerSequencer;
use crate::refcount::{liveness, SubsysRefCount};
use crate::sleep::{SleepWakeManager, WakeSource};
use crate::sync::{plock, CancelToken, Completion, WaitError};

/// 启动状态机。`Failed` 是终态之一：芯片已下电，下次 open 从头来过。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootState {
    PoweredOff,
    PoweringOn,
    GnssDownloading,
    GnssRunning,
    BtwfDownloading,
    BtwfRunning,
    Ready,
    Failed,
}

impl BootState {
    pub const fn name(self) -> &'static str {
        match self {
            BootState::PoweredOff => "powered_off",
            BootState::PoweringOn => "powering_on",
            BootState::GnssDownloading => "gnss_downloading",
            BootState::GnssRunning => "gnss_running",
            BootState::BtwfDownloading => "btwf_downloading",
            BootState::BtwfRunning => "btwf_running",
            BootState::Ready => "ready",
            BootState::Failed => "failed",
        }
    }

    const fn is_transitional(self) -> bool {
        matches!(
            self,
            BootState::PoweringOn
                | BootState::GnssDownloading
                | BootState::GnssRunning
                | BootState::BtwfDownloading
                | BootState::BtwfRunning
        )
    }
}

struct BootMachine {
    state: BootState,
    gnss_running: bool,
    btwf_running: bool,
    /// 两核固件都下载并放跑过（冷启动完成的标志，整芯片下电时清掉）。
    download_done: bool,
    detached: bool,
    worker: Option<JoinHandle<()>>,
}

const fn needs_gnss(su: WcnSubsys) -> bool {
    matches!(su, WcnSubsys::Gnss | WcnSubsys::Auto | WcnSubsys::All)
}

const fn needs_btwf(su: WcnSubsys) -> bool {
    su.is_btwf() || matches!(su, WcnSubsys::Auto | WcnSubsys::All)
}

/// 过渡态收敛的兜底等待余量。
const SETTLE_SLACK: Duration = Duration::from_secs(10);
/// 过渡态等待的轮询步片。
const SETTLE_SLICE: Duration = Duration::from_millis(50);

type Guard<'a> = MutexGuard<'a, BootMachine>;

/// 启动协调器。
pub(crate) struct BootCoordinator {
    machine: StdMutex<BootMachine>,
    settled: Condvar,
    seq: Arc<PowerSequencer>,
    loader: Arc<FirmwareLoader>,
    slp: Arc<SleepWakeManager>,
    mem_pd: Arc<MemPdManager>,
    refcount: Arc<SubsysRefCount>,
    /// 冷启动前外部电源协调方的就绪信号。
    readiness: Completion<()>,
    cancel: CancelToken,
    bus: SharedBus,
    profile: &'static ChipProfile,
    gnss_timeout: Duration,
    btwf_timeout: Duration,
    readiness_wait: Duration,
    skip_readiness: bool,
    no_power_off: bool,
}

impl BootCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        seq: Arc<PowerSequencer>,
        loader: Arc<FirmwareLoader>,
        slp: Arc<SleepWakeManager>,
        mem_pd: Arc<MemPdManager>,
        refcount: Arc<SubsysRefCount>,
        bus: SharedBus,
        profile: &'static ChipProfile,
        cfg: &WcnConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            machine: StdMutex::new(BootMachine {
                state: BootState::PoweredOff,
                gnss_running: false,
                btwf_running: false,
                download_done: false,
                detached: false,
                worker: None,
            }),
            settled: Condvar::new(),
            seq,
            loader,
            slp,
            mem_pd,
            refcount,
            readiness: Completion::new(),
            cancel,
            bus,
            profile,
            gnss_timeout: Duration::from_millis(
                cfg.gnss_boot_timeout_ms
                    .unwrap_or(profile.gnss_boot_timeout_ms),
            ),
            btwf_timeout: Duration::from_millis(
                cfg.btwf_boot_timeout_ms
                    .unwrap_or(profile.btwf_boot_timeout_ms),
            ),
            readiness_wait: Duration::from_millis(cfg.readiness_wait_ms),
            skip_readiness: cfg.skip_readiness_wait,
            no_power_off: cfg.no_power_off,
        }
    }

    pub(crate) fn state(&self) -> BootState {
        plock(&self.machine).state
    }

    pub(crate) fn is_powered(&self) -> bool {
        !matches!(self.state(), BootState::PoweredOff | BootState::Failed)
    }

    /// 外部电源协调方就绪通告。
    pub(crate) fn external_ready(&self) {
        self.readiness.complete(());
    }

    /// 等机器离开过渡态。有界兜底，取消令牌生效。
    fn wait_settled<'a>(&'a self, mut g: Guard<'a>) -> WcnResult<Guard<'a>> {
        let deadline = Instant::now() + self.gnss_timeout + self.btwf_timeout + SETTLE_SLACK;
        while g.state.is_transitional() {
            if self.cancel.is_cancelled() {
                return Err(WcnError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(WcnError::BadState("boot machine did not settle"));
            }
            let (g2, _) = self
                .settled
                .wait_timeout(g, SETTLE_SLICE)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            g = g2;
        }
        Ok(g)
    }

    /// 打开子系统：按需冷启动或单核补启，成功后置位图位。
    pub(crate) fn open_subsys(&self, su: WcnSubsys, events: &mut Vec<WcnEvent>) -> WcnResult<()> {
        let g = plock(&self.machine);
        let mut g = self.wait_settled(g)?;
        if g.detached {
            return Err(WcnError::BadState("controller detached"));
        }
        if g.state == BootState::Failed {
            // 上次启动失败，芯片已下电，这次从头来
            g.state = BootState::PoweredOff;
        }

        let mut cold_booted = false;
        if !g.download_done {
            let (g2, res) = self.cold_boot(g, events);
            g = g2;
            res?;
            cold_booted = true;
            // 没人要 GNSS 就把它的电域关掉省电
            let keep =
                needs_gnss(su) || (self.refcount.bitmap() & (GNSS_MASK | AUTO_MASK)) != 0;
            if !keep {
                match self.gnss_domain_close() {
                    Ok(()) => g.gnss_running = false,
                    Err(e) => log::warn!(
                        target: "wcn::bsp::boot",
                        "gnss domain close failed: {}", e
                    ),
                }
            }
        } else if needs_gnss(su) && !g.gnss_running {
            let (g2, res) = self.partial_boot(g, CpCore::Gnss, events);
            g = g2;
            res?;
        } else if needs_btwf(su) && !g.btwf_running {
            let (g2, res) = self.partial_boot(g, CpCore::Btwf, events);
            g = g2;
            res?;
        }

        let out = self.refcount.open(su);
        if out.already {
            log::debug!(target: "wcn::bsp::boot", "{} already open", su.name());
        } else {
            log::info!(
                target: "wcn::bsp::boot",
                "{} open (bitmap 0x{:02x})",
                su.name(),
                out.now
            );
        }
        if cold_booted {
            events.push(WcnEvent::PowerStateChanged {
                powered: true,
                bitmap: out.now,
            });
        }
        push_liveness_change(events, out.prev, out.now);
        // 位图更新与事件收集都在机器锁内完成，放锁即对外可见
        drop(g);
        Ok(())
    }

    /// 关闭子系统：清位，按需做 GNSS 域下电或整芯片下电。
    pub(crate) fn close_subsys(&self, su: WcnSubsys, events: &mut Vec<WcnEvent>) -> WcnResult<()> {
        let g = plock(&self.machine);
        let mut g = self.wait_settled(g)?;
        if g.detached {
            return Err(WcnError::BadState("controller detached"));
        }

        let out = self.refcount.close(su);
        if !out.was_open {
            log::debug!(target: "wcn::bsp::boot", "{} not open, close is a no-op", su.name());
            return Ok(());
        }
        log::info!(
            target: "wcn::bsp::boot",
            "{} close (bitmap 0x{:02x})",
            su.name(),
            out.now
        );
        push_liveness_change(events, out.prev, out.now);

        if out.last {
            if self.no_power_off {
                log::info!(
                    target: "wcn::bsp::boot",
                    "power off override active, chip stays up"
                );
            } else {
                log::info!(target: "wcn::bsp::boot", "last subsystem closed, chip power off");
                self.power_off_locked(&mut g, events);
            }
        } else if g.gnss_running
            && (out.prev & (GNSS_MASK | AUTO_MASK)) != 0
            && (out.now & (GNSS_MASK | AUTO_MASK)) == 0
        {
            // 最后一个 GNSS 侧用户走了，BTWF 还有人在用：只关 GNSS 域
            match self.slp.ensure_awake(WakeSource::Boot) {
                Ok(()) => {
                    match self.gnss_domain_close() {
                        Ok(()) => g.gnss_running = false,
                        Err(e) => log::warn!(
                            target: "wcn::bsp::boot",
                            "gnss domain close failed: {}", e
                        ),
                    }
                    if let Err(e) = self.slp.allow_sleep(WakeSource::Boot) {
                        log::warn!(target: "wcn::bsp::boot", "sleep release failed: {}", e);
                    }
                }
                Err(e) => log::warn!(
                    target: "wcn::bsp::boot",
                    "wake for gnss domain close failed: {}", e
                ),
            }
        }
        Ok(())
    }

    /// 拆除：等在途流程收尾（取消令牌已置位），有必要则下电，收割工码。
    pub(crate) fn detach(&self, events: &mut Vec<WcnEvent>) {
        let mut g = plock(&self.machine);
        if g.detached {
            return;
        }
        g.detached = true;
        let deadline = Instant::now() + self.gnss_timeout + self.btwf_timeout + SETTLE_SLACK;
        while g.state.is_transitional() && Instant::now() < deadline {
            let (g2, _) = self
                .settled
                .wait_timeout(g, SETTLE_SLICE)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            g = g2;
        }
        if !matches!(g.state, BootState::PoweredOff | BootState::Failed) {
            let prev = self.refcount.force_clear();
            if prev & REAL_MASK != 0 {
                events.push(WcnEvent::Liveness(crate::export::LivenessHint::Empty));
            }
            log::info!(target: "wcn::bsp::boot", "detach: chip power off");
            self.power_off_locked(&mut g, events);
        }
        let worker = g.worker.take();
        drop(g);
        if let Some(h) = worker {
            let _ = h.join();
        }
    }

    // ---- 冷启动与单核补启 ----

    fn cold_boot<'a>(
        &'a self,
        mut g: Guard<'a>,
        events: &mut Vec<WcnEvent>,
    ) -> (Guard<'a>, WcnResult<()>) {
        g.state = BootState::PoweringOn;
        self.slp.reset();
        if let Err(e) = self.seq.power_on() {
            self.teardown_locked(&mut g, events, e.clone());
            return (g, Err(e));
        }
        if let Err(e) = self.readiness_rendezvous() {
            self.teardown_locked(&mut g, events, e.clone());
            return (g, Err(e));
        }

        log::info!(target: "wcn::bsp::boot", "cold boot: gnss core first");
        let (mut g, res) = self.download_step(
            g,
            CpCore::Gnss,
            BootState::GnssDownloading,
            self.gnss_timeout,
            WcnError::GnssBootTimeout,
        );
        if let Err(e) = res {
            self.teardown_locked(&mut g, events, e.clone());
            return (g, Err(e));
        }
        g.state = BootState::GnssRunning;
        g.gnss_running = true;

        let (mut g, res) = self.download_step(
            g,
            CpCore::Btwf,
            BootState::BtwfDownloading,
            self.btwf_timeout,
            WcnError::BtwfBootTimeout,
        );
        if let Err(e) = res {
            self.teardown_locked(&mut g, events, e.clone());
            return (g, Err(e));
        }
        g.state = BootState::BtwfRunning;
        g.btwf_running = true;
        g.download_done = true;
        g.state = BootState::Ready;
        self.settled.notify_all();
        log::info!(target: "wcn::bsp::boot", "cold boot complete");
        (g, Ok(()))
    }

    /// 芯片已就绪、只有一个核缺席时的补启。下载超时仍按致命处理。
    fn partial_boot<'a>(
        &'a self,
        g: Guard<'a>,
        core: CpCore,
        events: &mut Vec<WcnEvent>,
    ) -> (Guard<'a>, WcnResult<()>) {
        log::info!(
            target: "wcn::bsp::boot",
            "{} core boot (chip stays up)",
            core.name()
        );
        if let Err(e) = self.slp.ensure_awake(WakeSource::Boot) {
            events.push(WcnEvent::BootError(e.clone()));
            return (g, Err(e));
        }
        if core == CpCore::Gnss {
            if let Err(e) = self.gnss_domain_open() {
                events.push(WcnEvent::BootError(e.clone()));
                let _ = self.slp.allow_sleep(WakeSource::Boot);
                return (g, Err(e));
            }
        }
        let during = match core {
            CpCore::Gnss => BootState::GnssDownloading,
            CpCore::Btwf => BootState::BtwfDownloading,
        };
        let to_err = match core {
            CpCore::Gnss => WcnError::GnssBootTimeout,
            CpCore::Btwf => WcnError::BtwfBootTimeout,
        };
        let (mut g, res) = self.download_step(g, core, during, self.timeout_of(core), to_err);
        match res {
            Ok(()) => {
                if let Err(e) = self.slp.allow_sleep(WakeSource::Boot) {
                    log::warn!(target: "wcn::bsp::boot", "sleep release failed: {}", e);
                }
                match core {
                    CpCore::Gnss => g.gnss_running = true,
                    CpCore::Btwf => g.btwf_running = true,
                }
                g.state = BootState::Ready;
                self.settled.notify_all();
                (g, Ok(()))
            }
            Err(e) => {
                self.teardown_locked(&mut g, events, e.clone());
                (g, Err(e))
            }
        }
    }

    fn timeout_of(&self, core: CpCore) -> Duration {
        match core {
            CpCore::Gnss => self.gnss_timeout,
            CpCore::Btwf => self.btwf_timeout,
        }
    }

    /// 一个核的下载步：标过渡态、派工码、放锁等完成、回锁收结果。
    fn download_step<'a>(
        &'a self,
        mut g: Guard<'a>,
        core: CpCore,
        during: BootState,
        timeout: Duration,
        timeout_err: WcnError,
    ) -> (Guard<'a>, WcnResult<()>) {
        g.state = during;
        if let Some(h) = g.worker.take() {
            if h.is_finished() {
                let _ = h.join();
            } else {
                log::debug!(target: "wcn::bsp::boot", "stale download worker detached");
            }
        }
        let done: Completion<WcnResult<()>> = Completion::new();
        g.worker = self.spawn_download(core, done.clone());
        drop(g);

        let res = done.wait_for(timeout, &self.cancel);
        let g = plock(&self.machine);
        let out = match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(WaitError::Timeout) => {
                log::error!(
                    target: "wcn::bsp::boot",
                    "{} download timed out after {}ms",
                    core.name(),
                    timeout.as_millis()
                );
                Err(timeout_err)
            }
            Err(WaitError::Cancelled) => Err(WcnError::Cancelled),
        };
        (g, out)
    }

    fn spawn_download(
        &self,
        core: CpCore,
        done: Completion<WcnResult<()>>,
    ) -> Option<JoinHandle<()>> {
        let loader = self.loader.clone();
        let done_in_worker = done.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("wcn-dl-{}", core.name()))
            .spawn(move || {
                let result = loader.boot_core(core);
                if let Err(ref e) = result {
                    log::error!(
                        target: "wcn::bsp::boot",
                        "{} download worker failed: {}",
                        core.name(),
                        e
                    );
                }
                done_in_worker.complete(result);
            });
        match spawned {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!(target: "wcn::bsp::boot", "download worker spawn failed: {}", e);
                done.complete(Err(WcnError::ResourceAlloc));
                None
            }
        }
    }

    /// 冷启动前与外部电源协调方会合。等不到只告警，不挡启动。
    fn readiness_rendezvous(&self) -> WcnResult<()> {
        if self.skip_readiness {
            return Ok(());
        }
        match self.readiness.wait_for(self.readiness_wait, &self.cancel) {
            Ok(()) => {
                log::debug!(target: "wcn::bsp::boot", "power coordinator ready");
                Ok(())
            }
            Err(WaitError::Timeout) => {
                log::warn!(
                    target: "wcn::bsp::boot",
                    "no readiness signal within {}ms, boot continues",
                    self.readiness_wait.as_millis()
                );
                Ok(())
            }
            Err(WaitError::Cancelled) => Err(WcnError::Cancelled),
        }
    }

    // ---- GNSS 电域 ----

    fn gnss_domain_open(&self) -> WcnResult<()> {
        BusRegister::new(self.bus.clone(), self.profile.gnss_pd_cfg_reg)
            .clear_bits(self.profile.gnss_force_sleep_bits)
            .map_err(WcnError::from_errno)?;
        BusRegister::new(self.bus.clone(), self.profile.gnss_fake_cfg_reg)
            .clear_bits(self.profile.gnss_fake_sel_bits)
            .map_err(WcnError::from_errno)?;
        log::debug!(target: "wcn::bsp::boot", "gnss power domain open");
        Ok(())
    }

    fn gnss_domain_close(&self) -> WcnResult<()> {
        BusRegister::new(self.bus.clone(), self.profile.gnss_pd_cfg_reg)
            .set_bits(self.profile.gnss_force_sleep_bits)
            .map_err(WcnError::from_errno)?;
        log::info!(target: "wcn::bsp::boot", "gnss power domain closed");
        Ok(())
    }

    // ---- 下电与回滚 ----

    /// 正常整芯片下电（锁内）。
    fn power_off_locked(&self, g: &mut BootMachine, events: &mut Vec<WcnEvent>) {
        self.seq.power_off();
        g.download_done = false;
        g.gnss_running = false;
        g.btwf_running = false;
        g.state = BootState::PoweredOff;
        self.slp.reset();
        self.mem_pd.reset_for_power_off();
        events.push(WcnEvent::PowerStateChanged {
            powered: false,
            bitmap: self.refcount.bitmap(),
        });
        self.settled.notify_all();
    }

    /// 启动失败回滚：下电、位图清零、状态落 `Failed`。
    fn teardown_locked(&self, g: &mut BootMachine, events: &mut Vec<WcnEvent>, err: WcnError) {
        log::error!(target: "wcn::bsp::boot", "boot failed ({}), tearing down", err);
        events.push(WcnEvent::BootError(err));
        let prev = self.refcount.force_clear();
        self.seq.power_off();
        g.download_done = false;
        g.gnss_running = false;
        g.btwf_running = false;
        g.state = BootState::Failed;
        self.slp.reset();
        self.mem_pd.reset_for_power_off();
        if prev & REAL_MASK != 0 {
            events.push(WcnEvent::Liveness(crate::export::LivenessHint::Empty));
        }
        events.push(WcnEvent::PowerStateChanged {
            powered: false,
            bitmap: 0,
        });
        self.settled.notify_all();
    }
}

fn push_liveness_change(events: &mut Vec<WcnEvent>, prev: u32, now: u32) {
    let before = liveness(prev);
    let after = liveness(now);
    if before != after {
        if let Some(hint) = after {
            events.push(WcnEvent::Liveness(hint));
        }
    }
}
