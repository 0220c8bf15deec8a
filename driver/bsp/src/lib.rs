//! marlin WCN 芯片生命周期驱动
//!
//! UNISOC marlin 系列 BT/FM/WiFi/GNSS 组合芯片的上下电、固件下载、启动
//! 协调、休眠唤醒与内存电域管理。子系统驱动不直接碰电源和固件，统一通过
//! [`WcnController`] 按位图开关自己：首开冷启动整芯片，末关整芯片下电。
//!
//! 功能包括:
//! - 上下电序列（时钟/电源轨/chip_en/reset，检卡等待）
//! - 固件容器解析、按芯片版本选片、分包下载
//! - 启动协调（GNSS 先于 BTWF、超时回滚、单核补启）
//! - 休眠/唤醒握手与唤醒源计数
//! - WiFi/BT 内存电域的保存-断电-恢复协商
//!
//! 总线与板级硬件走 [`bus::WcnBus`] 与 [`PlatformHw`] 两个接口，实现由
//! 平台侧注入，本 crate 不含任何平台代码。

mod boot;
mod chip;
mod error;
mod export;
mod firmware;
mod fw_load;
mod mem_pd;
mod power;
mod refcount;
mod sleep;
mod sync;

#[cfg(test)]
mod testutil;

pub use boot::BootState;
pub use chip::{profile_for, ChipFamily, ChipProfile, MemPdDomain};
pub use error::{WcnError, WcnResult};
pub use export::{
    CpCore, EventCallback, LivenessHint, MemPdState, SleepStatus, SleepTimeoutPolicy, WcnConfig,
    WcnEvent, WcnSubsys, AUTO_MASK, BTWF_MASK, GNSS_MASK, REAL_MASK,
};
pub use firmware::{ImageEntry, IMG_HEAD_MAGIC, IMG_TAG_AA, IMG_TAG_AB};
pub use power::PlatformHw;
pub use sync::{delay_ms, CancelToken};

pub use bus::{SharedBus, WcnBus};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use boot::BootCoordinator;
use fw_load::FirmwareLoader;
use mem_pd::MemPdManager;
use power::PowerSequencer;
use refcount::SubsysRefCount;
use sleep::{SleepWakeManager, WakeSource};
use sync::plock;

/// 自动首启延迟的睡眠分片，拆除时最多陪睡一个分片。
const AUTO_BOOT_SLICE: Duration = Duration::from_millis(50);

/// 控制器共享体。外层句柄与自动首启线程各持一份引用。
struct ControllerInner {
    boot: BootCoordinator,
    loader: Arc<FirmwareLoader>,
    slp: Arc<SleepWakeManager>,
    mem_pd: Arc<MemPdManager>,
    refcount: Arc<SubsysRefCount>,
    cancel: CancelToken,
    callback: Option<EventCallback>,
    detached: AtomicBool,
    auto_boot: StdMutex<Option<JoinHandle<()>>>,
}

impl ControllerInner {
    /// 事件统一在锁外送出，回调内不得再进控制器接口。
    fn emit(&self, events: &[WcnEvent]) {
        if let Some(cb) = &self.callback {
            for ev in events {
                cb(ev);
            }
        }
    }

    /// 首启：以 `Auto` 占位开一轮再关掉。把整条冷启动链路（上电、检卡、
    /// 两核下载）走通一遍，位图随后归零按常规策略收尾。
    fn ensure_first_boot(&self) -> WcnResult<()> {
        let mut events = Vec::new();
        let res = self
            .boot
            .open_subsys(WcnSubsys::Auto, &mut events)
            .and_then(|()| self.boot.close_subsys(WcnSubsys::Auto, &mut events));
        self.emit(&events);
        res
    }

    fn mem_pd_request_for(&self, su: WcnSubsys, want_on: bool) -> WcnResult<()> {
        match su {
            WcnSubsys::All => {
                self.mem_pd.request(WcnSubsys::Wifi, want_on)?;
                self.mem_pd.request(WcnSubsys::Bluetooth, want_on)
            }
            _ => self.mem_pd.request(su, want_on),
        }
    }
}

/// WCN 芯片控制器。[`attach`](WcnController::attach) 装上，句柄丢弃或
/// [`detach`](WcnController::detach) 后芯片下电、全部接口拒绝服务。
pub struct WcnController {
    inner: Arc<ControllerInner>,
}

impl WcnController {
    /// 装上芯片：校验配置、装配各执行件。配置了 `auto_boot_delay_ms`
    /// 则在后台线程延迟触发首启。
    pub fn attach(
        hw: Arc<dyn PlatformHw>,
        bus: SharedBus,
        cfg: WcnConfig,
        callback: Option<EventCallback>,
    ) -> WcnResult<WcnController> {
        cfg.validate()?;
        let profile = profile_for(cfg.family);
        log::info!(
            target: "wcn::bsp",
            "wcn attach: family {}, btwf fw {}, gnss fw {}",
            profile.family.name(),
            cfg.btwf_firmware,
            cfg.gnss_firmware
        );
        let cancel = CancelToken::new();
        let refcount = Arc::new(SubsysRefCount::new());
        let seq = Arc::new(PowerSequencer::new(hw, bus.clone(), &cfg, cancel.clone())?);
        let loader = Arc::new(FirmwareLoader::new(
            bus.clone(),
            profile,
            &cfg,
            cancel.clone(),
        ));
        let slp = Arc::new(SleepWakeManager::new(
            bus.clone(),
            profile,
            cfg.sleep_timeout_policy,
            cancel.clone(),
        ));
        let mem_pd = Arc::new(MemPdManager::new(
            bus.clone(),
            profile,
            slp.clone(),
            &cfg,
            cancel.clone(),
        ));
        let boot = BootCoordinator::new(
            seq,
            loader.clone(),
            slp.clone(),
            mem_pd.clone(),
            refcount.clone(),
            bus,
            profile,
            &cfg,
            cancel.clone(),
        );
        let inner = Arc::new(ControllerInner {
            boot,
            loader,
            slp,
            mem_pd,
            refcount,
            cancel: cancel.clone(),
            callback,
            detached: AtomicBool::new(false),
            auto_boot: StdMutex::new(None),
        });

        if let Some(delay) = cfg.auto_boot_delay_ms {
            // 弱引用：句柄先没了就不启了
            let weak = Arc::downgrade(&inner);
            let spawned = std::thread::Builder::new()
                .name("wcn-boot".into())
                .spawn(move || {
                    let deadline = Instant::now() + Duration::from_millis(delay);
                    loop {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        std::thread::sleep((deadline - now).min(AUTO_BOOT_SLICE));
                    }
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = inner.ensure_first_boot() {
                        log::error!(target: "wcn::bsp", "auto first boot failed: {}", e);
                    }
                });
            match spawned {
                Ok(h) => *plock(&inner.auto_boot) = Some(h),
                Err(e) => {
                    log::warn!(target: "wcn::bsp", "auto boot thread spawn failed: {}", e)
                }
            }
        }
        Ok(WcnController { inner })
    }

    fn guard_attached(&self) -> WcnResult<()> {
        if self.inner.detached.load(Ordering::SeqCst) {
            return Err(WcnError::BadState("controller detached"));
        }
        Ok(())
    }

    /// 打开子系统。首开触发冷启动；芯片已就绪而该侧核缺席时只补启那
    /// 一个核；其余情况只是置位。需要时顺带把对应内存电域拉起来。
    pub fn open(&self, su: WcnSubsys) -> WcnResult<()> {
        self.guard_attached()?;
        let mut events = Vec::new();
        let res = match self.inner.boot.open_subsys(su, &mut events) {
            Ok(()) => match self.inner.mem_pd_request_for(su, true) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // 内存域没拉起来，位图回退，不给上层半残的子系统
                    let _ = self.inner.boot.close_subsys(su, &mut events);
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        self.inner.emit(&events);
        res
    }

    /// 关闭子系统。末关整芯片下电（除非配置保持供电）；只收掉 GNSS 侧
    /// 时单关 GNSS 电域。未打开的子系统关闭是无动作。
    pub fn close(&self, su: WcnSubsys) -> WcnResult<()> {
        self.guard_attached()?;
        let mut events = Vec::new();
        if self.inner.refcount.is_open(su) {
            // 趁芯片还醒着、CP 还能应答，先把内存域断下去
            if let Err(e) = self.inner.mem_pd_request_for(su, false) {
                log::warn!(target: "wcn::bsp", "mem domain drain on close failed: {}", e);
            }
        }
        let res = self.inner.boot.close_subsys(su, &mut events);
        self.inner.emit(&events);
        res
    }

    /// 手动触发首启（等价于配置的自动首启）。
    pub fn ensure_first_boot(&self) -> WcnResult<()> {
        self.guard_attached()?;
        self.inner.ensure_first_boot()
    }

    /// 拆除：取消在途流程、收自动首启线程、位图清零、下电。幂等。
    pub fn detach(&self) {
        if self.inner.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "wcn::bsp", "wcn detach");
        self.inner.cancel.cancel();
        let auto = plock(&self.inner.auto_boot).take();
        if let Some(h) = auto {
            let _ = h.join();
        }
        let mut events = Vec::new();
        self.inner.boot.detach(&mut events);
        self.inner.emit(&events);
    }

    /// 当前打开位图。
    pub fn status_bitmap(&self) -> u32 {
        self.inner.refcount.bitmap()
    }

    pub fn is_open(&self, su: WcnSubsys) -> bool {
        self.inner.refcount.is_open(su)
    }

    pub fn boot_state(&self) -> BootState {
        self.inner.boot.state()
    }

    pub fn is_powered(&self) -> bool {
        self.inner.boot.is_powered()
    }

    pub fn sleep_status(&self) -> SleepStatus {
        self.inner.slp.status()
    }

    /// 查询内存电域状态；非域子系统或该家族不分域时为 `None`。
    pub fn mem_pd_state(&self, su: WcnSubsys) -> Option<MemPdState> {
        self.inner.mem_pd.state(su)
    }

    /// 上层直接塞一份镜像（同名覆盖），优先于分区扫描。
    pub fn register_firmware(&self, name: &str, data: &[u8]) {
        self.inner.loader.register_firmware(name, data);
    }

    /// 外部电源协调方就绪通告（冷启动前的会合点）。
    pub fn external_ready(&self) {
        self.inner.boot.external_ready();
    }

    /// 子系统要求芯片保持清醒（收发窗口前调用）。
    pub fn ensure_awake(&self, su: WcnSubsys) -> WcnResult<()> {
        self.guard_attached()?;
        self.inner.slp.ensure_awake(WakeSource::Subsys(su))
    }

    /// 子系统放行休眠。最后一个唤醒源放行时才真正允许芯片睡。
    pub fn allow_sleep(&self, su: WcnSubsys) -> WcnResult<()> {
        self.guard_attached()?;
        self.inner.slp.allow_sleep(WakeSource::Subsys(su))
    }

    /// CP 报“支持分域断电”的探测应答入口。
    pub fn mem_remote_ready(&self) {
        self.inner.mem_pd.remote_ready();
    }

    /// CP 应答：`su` 的内存域上电侧搬运完成。
    pub fn mem_ack_opened(&self, su: WcnSubsys) {
        self.inner.mem_pd.ack_opened(su);
    }

    /// CP 应答：`su` 的内存域已腾空，可以断电。
    pub fn mem_ack_closed(&self, su: WcnSubsys) {
        self.inner.mem_pd.ack_closed(su);
    }
}

impl Drop for WcnController {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_config, MockHw};
    use bus::{BusOp, MemBus};

    fn controller_on(bus: &Arc<MemBus>, cfg: WcnConfig) -> WcnController {
        let shared: SharedBus = bus.clone();
        WcnController::attach(Arc::new(MockHw::new()), shared, cfg, None).unwrap()
    }

    fn load_firmware(ctl: &WcnController) {
        ctl.register_firmware("wcnmodem", &[0x5au8; 4096]);
        ctl.register_firmware("gnssmodem", &[0xa5u8; 2048]);
    }

    fn direct_write_addrs(bus: &MemBus) -> Vec<u32> {
        bus.journal()
            .into_iter()
            .filter_map(|op| match op {
                BusOp::DirectWrite { addr, .. } => Some(addr),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_open_cold_boots_gnss_before_btwf() {
        let bus = Arc::new(MemBus::new());
        let profile = profile_for(ChipFamily::Marlin3);
        // 两核复位位摆成“按住”，看启动把它们放开
        bus.preset_reg(profile.cp_reset_reg, profile.cp_reset_release_bits);
        bus.preset_reg(profile.gnss_cp_reset_reg, profile.gnss_cp_reset_release_bits);
        let ctl = controller_on(&bus, test_config());
        load_firmware(&ctl);

        ctl.open(WcnSubsys::Wifi).unwrap();
        assert_eq!(ctl.boot_state(), BootState::Ready);
        assert!(ctl.is_powered());
        assert_eq!(ctl.status_bitmap(), WcnSubsys::Wifi.bits());

        let writes = direct_write_addrs(&bus);
        let gnss_pos = writes
            .iter()
            .position(|a| *a == profile.gnss_cp_start_addr)
            .unwrap();
        let btwf_pos = writes
            .iter()
            .position(|a| *a == profile.cp_start_addr)
            .unwrap();
        assert!(gnss_pos < btwf_pos, "gnss image must go down first");

        // 两核复位都已放开
        assert_eq!(
            bus.peek_reg(profile.cp_reset_reg) & profile.cp_reset_release_bits,
            0
        );
        assert_eq!(
            bus.peek_reg(profile.gnss_cp_reset_reg) & profile.gnss_cp_reset_release_bits,
            0
        );
    }

    #[test]
    fn second_open_only_sets_the_bit() {
        let bus = Arc::new(MemBus::new());
        let ctl = controller_on(&bus, test_config());
        load_firmware(&ctl);

        ctl.open(WcnSubsys::Wifi).unwrap();
        bus.clear_journal();

        ctl.open(WcnSubsys::Fm).unwrap();
        assert!(direct_write_addrs(&bus).is_empty(), "no second download");
        assert_eq!(
            ctl.status_bitmap(),
            WcnSubsys::Wifi.bits() | WcnSubsys::Fm.bits()
        );
    }

    #[test]
    fn chip_stays_up_until_the_last_close() {
        let bus = Arc::new(MemBus::new());
        let ctl = controller_on(&bus, test_config());
        load_firmware(&ctl);

        ctl.open(WcnSubsys::Wifi).unwrap();
        ctl.open(WcnSubsys::Bluetooth).unwrap();

        ctl.close(WcnSubsys::Wifi).unwrap();
        assert!(ctl.is_powered());
        assert!(ctl.is_open(WcnSubsys::Bluetooth));

        ctl.close(WcnSubsys::Bluetooth).unwrap();
        assert!(!ctl.is_powered());
        assert_eq!(ctl.boot_state(), BootState::PoweredOff);
        assert_eq!(ctl.status_bitmap(), 0);
    }

    #[test]
    fn close_of_unopened_subsystem_is_noop() {
        let bus = Arc::new(MemBus::new());
        let ctl = controller_on(&bus, test_config());

        ctl.close(WcnSubsys::Wifi).unwrap();
        assert!(!ctl.is_powered());
        assert!(bus.journal().is_empty());
    }

    #[test]
    fn gnss_domain_follows_its_users() {
        let bus = Arc::new(MemBus::new());
        let profile = profile_for(ChipFamily::Marlin3);
        let ctl = controller_on(&bus, test_config());
        load_firmware(&ctl);

        // 首开只有 BTWF 侧用户：冷启动后 GNSS 域关掉省电
        ctl.open(WcnSubsys::Wifi).unwrap();
        assert_eq!(
            bus.peek_reg(profile.gnss_pd_cfg_reg) & profile.gnss_force_sleep_bits,
            profile.gnss_force_sleep_bits
        );

        // 开 GNSS：域重开 + 补启 GNSS 核
        bus.clear_journal();
        ctl.open(WcnSubsys::Gnss).unwrap();
        assert_eq!(
            bus.peek_reg(profile.gnss_pd_cfg_reg) & profile.gnss_force_sleep_bits,
            0
        );
        assert!(direct_write_addrs(&bus).contains(&profile.gnss_cp_start_addr));
        assert_eq!(ctl.boot_state(), BootState::Ready);

        // 关 GNSS（WiFi 还在）：域再关，芯片不下电
        ctl.close(WcnSubsys::Gnss).unwrap();
        assert!(ctl.is_powered());
        assert_eq!(
            bus.peek_reg(profile.gnss_pd_cfg_reg) & profile.gnss_force_sleep_bits,
            profile.gnss_force_sleep_bits
        );
    }

    #[test]
    fn gnss_download_timeout_tears_the_chip_down() {
        let bus = Arc::new(MemBus::new());
        // 每包 100ms，40ms 限时必超
        bus.set_direct_write_delay_ms(100);
        let mut cfg = test_config();
        cfg.gnss_boot_timeout_ms = Some(40);
        cfg.btwf_boot_timeout_ms = Some(40);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: EventCallback = Box::new(move |ev| sink.lock().unwrap().push(ev.clone()));
        let shared: SharedBus = bus.clone();
        let ctl = WcnController::attach(Arc::new(MockHw::new()), shared, cfg, Some(cb)).unwrap();
        load_firmware(&ctl);

        assert_eq!(ctl.open(WcnSubsys::Bluetooth), Err(WcnError::GnssBootTimeout));
        assert_eq!(ctl.boot_state(), BootState::Failed);
        assert!(!ctl.is_powered());
        assert_eq!(ctl.status_bitmap(), 0);
        {
            let seen = seen.lock().unwrap();
            assert!(seen.contains(&WcnEvent::BootError(WcnError::GnssBootTimeout)));
            assert!(seen.contains(&WcnEvent::PowerStateChanged {
                powered: false,
                bitmap: 0
            }));
        }

        // 失败不粘人：下一次 open 从头冷启动
        bus.set_direct_write_delay_ms(0);
        ctl.open(WcnSubsys::Bluetooth).unwrap();
        assert_eq!(ctl.boot_state(), BootState::Ready);
        assert!(ctl.is_open(WcnSubsys::Bluetooth));
    }

    #[test]
    fn mid_boot_bus_error_rolls_back() {
        let bus = Arc::new(MemBus::new());
        // GNSS 一包写完，BTWF 第一包就断
        bus.fail_direct_write_after(1);
        let ctl = controller_on(&bus, test_config());
        load_firmware(&ctl);

        assert_eq!(
            ctl.open(WcnSubsys::Wifi),
            Err(WcnError::BusIo { errno: bus::EIO })
        );
        assert_eq!(ctl.boot_state(), BootState::Failed);
        assert_eq!(ctl.status_bitmap(), 0);
        assert!(!ctl.is_powered());
    }

    #[test]
    fn no_power_off_keeps_the_chip_warm() {
        let bus = Arc::new(MemBus::new());
        let mut cfg = test_config();
        cfg.no_power_off = true;
        let ctl = controller_on(&bus, cfg);
        load_firmware(&ctl);

        ctl.open(WcnSubsys::Wifi).unwrap();
        ctl.close(WcnSubsys::Wifi).unwrap();
        assert!(ctl.is_powered());
        assert_eq!(ctl.boot_state(), BootState::Ready);
        assert_eq!(ctl.status_bitmap(), 0);

        // 再开免下载
        bus.clear_journal();
        ctl.open(WcnSubsys::Bluetooth).unwrap();
        assert!(direct_write_addrs(&bus).is_empty());
    }

    #[test]
    fn auto_first_boot_downloads_then_releases() {
        let bus = Arc::new(MemBus::new());
        let mut cfg = test_config();
        cfg.auto_boot_delay_ms = Some(30);
        let ctl = controller_on(&bus, cfg);
        load_firmware(&ctl);

        let profile = profile_for(ChipFamily::Marlin3);
        let t0 = Instant::now();
        loop {
            let journal = bus.journal();
            if journal.contains(&BusOp::Unregister) && ctl.boot_state() == BootState::PoweredOff {
                break;
            }
            assert!(t0.elapsed() < Duration::from_secs(5), "auto boot never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        let writes = direct_write_addrs(&bus);
        assert!(writes.contains(&profile.gnss_cp_start_addr));
        assert!(writes.contains(&profile.cp_start_addr));
        assert_eq!(ctl.status_bitmap(), 0);
    }

    #[test]
    fn detach_before_auto_boot_skips_it() {
        let bus = Arc::new(MemBus::new());
        let mut cfg = test_config();
        cfg.auto_boot_delay_ms = Some(5_000);
        let ctl = controller_on(&bus, cfg);

        ctl.detach();
        assert!(bus.journal().is_empty(), "nothing may touch the bus");
    }

    #[test]
    fn detach_powers_off_and_blocks_the_api() {
        let bus = Arc::new(MemBus::new());
        let ctl = controller_on(&bus, test_config());
        load_firmware(&ctl);
        ctl.open(WcnSubsys::Wifi).unwrap();

        ctl.detach();
        assert!(!ctl.is_powered());
        assert_eq!(ctl.status_bitmap(), 0);
        assert_eq!(
            ctl.open(WcnSubsys::Bluetooth),
            Err(WcnError::BadState("controller detached"))
        );
        assert_eq!(
            ctl.close(WcnSubsys::Wifi),
            Err(WcnError::BadState("controller detached"))
        );
        // 幂等
        ctl.detach();
    }
}
