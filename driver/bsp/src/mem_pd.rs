//! CP 内存电域管理
//!
//! WiFi 与 BT 各占一块可独立断电的 CP 内存。子系统关掉后把对应域断电省
//! 待机功耗，重开时恢复。断电丢内容，所以首次断电前先把两个域的镜像读
//! 回宿主各存一份，上电时原样写回。
//!
//! 开/关都要与 CP 协商：先敲门铃，等 CP 把该域里的活搬走（或接回）并
//! 应答，才能真正切电。CP 最慢要二十多秒，等待有界。能力是探测出来
//! 的：CP 起来后若限时不报支持，则整个特性降级为无动作。

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bus::{BusRegister, SharedBus};

use crate::chip::{ChipProfile, MemPdDomain};
use crate::error::{WcnError, WcnResult};
use crate::export::{MemPdState, WcnConfig, WcnSubsys};
use crate::sleep::{SleepWakeManager, WakeSource};
use crate::sync::{plock, CancelToken, Completion, WaitError};

/// 域序号：0 = WiFi，1 = BT。
const DOM_WIFI: usize = 0;
const DOM_BT: usize = 1;

fn domain_index(su: WcnSubsys) -> Option<usize> {
    match su {
        WcnSubsys::Wifi => Some(DOM_WIFI),
        WcnSubsys::Bluetooth => Some(DOM_BT),
        _ => None,
    }
}

fn domain_name(idx: usize) -> &'static str {
    if idx == DOM_WIFI {
        "wifi"
    } else {
        "bt"
    }
}

struct MemPdInner {
    probed: bool,
    supported: bool,
    state: [MemPdState; 2],
    saved: [Option<Vec<u8>>; 2],
    save_done: bool,
}

/// 电域管理器。
pub struct MemPdManager {
    bus: SharedBus,
    profile: &'static ChipProfile,
    slp: Arc<SleepWakeManager>,
    cancel: CancelToken,
    probe_timeout: Duration,
    ack_timeout: Duration,
    inner: StdMutex<MemPdInner>,
    /// CP 报“支持分域断电”的探测信号。
    ready: Completion<()>,
    open_ack: [Completion<()>; 2],
    close_ack: [Completion<()>; 2],
}

impl MemPdManager {
    pub fn new(
        bus: SharedBus,
        profile: &'static ChipProfile,
        slp: Arc<SleepWakeManager>,
        cfg: &WcnConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            bus,
            profile,
            slp,
            cancel,
            probe_timeout: Duration::from_millis(
                cfg.mem_pd_probe_timeout_ms
                    .unwrap_or(profile.mem_pd_probe_timeout_ms),
            ),
            ack_timeout: Duration::from_millis(
                cfg.mem_pd_ack_timeout_ms
                    .unwrap_or(profile.mem_pd_ack_timeout_ms),
            ),
            inner: StdMutex::new(MemPdInner {
                probed: false,
                supported: false,
                state: [MemPdState::PoweredUp; 2],
                saved: [None, None],
                save_done: false,
            }),
            ready: Completion::new(),
            open_ack: [Completion::new(), Completion::new()],
            close_ack: [Completion::new(), Completion::new()],
        }
    }

    fn domain_data(&self, idx: usize) -> Option<&'static MemPdDomain> {
        if idx == DOM_WIFI {
            self.profile.mem_pd_wifi.as_ref()
        } else {
            self.profile.mem_pd_bt.as_ref()
        }
    }

    /// 查询域状态；该家族没有此域时返回 `None`。
    pub fn state(&self, su: WcnSubsys) -> Option<MemPdState> {
        let idx = domain_index(su)?;
        self.domain_data(idx)?;
        Some(plock(&self.inner).state[idx])
    }

    /// CP 探测应答入口：上层收到“支持分域断电”消息后转发到这里。
    pub fn remote_ready(&self) {
        self.ready.complete(());
    }

    /// CP 应答：`su` 对应域已完成上电侧搬运。
    pub fn ack_opened(&self, su: WcnSubsys) {
        if let Some(idx) = domain_index(su) {
            self.open_ack[idx].complete(());
        }
    }

    /// CP 应答：`su` 对应域已腾空，可以断电。
    pub fn ack_closed(&self, su: WcnSubsys) {
        if let Some(idx) = domain_index(su) {
            self.close_ack[idx].complete(());
        }
    }

    /// 整芯片下电后的账面复位：域随芯片重新上电（固件重新下载）回到
    /// 全上电态；能力探测结论与已保存的镜像跨电源周期保留。
    pub fn reset_for_power_off(&self) {
        let mut inner = plock(&self.inner);
        inner.state = [MemPdState::PoweredUp; 2];
        self.open_ack[DOM_WIFI].reset();
        self.open_ack[DOM_BT].reset();
        self.close_ack[DOM_WIFI].reset();
        self.close_ack[DOM_BT].reset();
    }

    /// 把 `su` 对应的内存域带到目标供电状态。没有对应域（其余子系统、
    /// 不分域的家族、探测失败）时为无动作。
    pub fn request(&self, su: WcnSubsys, want_on: bool) -> WcnResult<()> {
        let Some(idx) = domain_index(su) else {
            return Ok(());
        };
        let Some(dom) = self.domain_data(idx) else {
            return Ok(());
        };
        // 整个协商期间压着芯片不许睡
        self.slp.ensure_awake(WakeSource::MemPd)?;
        let result = self.request_inner(idx, dom, want_on);
        if let Err(e) = self.slp.allow_sleep(WakeSource::MemPd) {
            log::warn!(target: "wcn::bsp::mem_pd", "sleep release failed: {}", e);
        }
        result
    }

    fn request_inner(&self, idx: usize, dom: &'static MemPdDomain, want_on: bool) -> WcnResult<()> {
        let mut inner = plock(&self.inner);
        if !inner.probed {
            match self.ready.wait_for(self.probe_timeout, &self.cancel) {
                Ok(()) => {
                    inner.supported = true;
                    log::info!(target: "wcn::bsp::mem_pd", "cp reports mem power domain support");
                }
                Err(WaitError::Timeout) => {
                    inner.supported = false;
                    log::warn!(
                        target: "wcn::bsp::mem_pd",
                        "no mem power domain support detected, feature disabled"
                    );
                }
                Err(WaitError::Cancelled) => return Err(WcnError::Cancelled),
            }
            inner.probed = true;
        }
        if !inner.supported {
            return Ok(());
        }

        match (want_on, inner.state[idx]) {
            (true, MemPdState::PoweredUp) | (false, MemPdState::PoweredDown) => {
                log::debug!(
                    target: "wcn::bsp::mem_pd",
                    "domain {} already in target state",
                    domain_name(idx)
                );
                Ok(())
            }
            (false, MemPdState::PoweredUp) => self.power_down(&mut inner, idx, dom),
            (true, MemPdState::PoweredDown) => self.power_up(&mut inner, idx, dom),
        }
    }

    /// 首次断电前把两个域的镜像各读回一份。只做一次，跨电源周期复用。
    fn save_images(&self, inner: &mut MemPdInner) -> WcnResult<()> {
        for idx in [DOM_WIFI, DOM_BT] {
            let Some(dom) = self.domain_data(idx) else {
                continue;
            };
            let size = dom.size as usize;
            let mut buf = Vec::new();
            buf.try_reserve_exact(size)
                .map_err(|_| WcnError::ResourceAlloc)?;
            buf.resize(size, 0);
            self.bus
                .direct_read(dom.base, &mut buf)
                .map_err(WcnError::from_errno)?;
            inner.saved[idx] = Some(buf);
            log::info!(
                target: "wcn::bsp::mem_pd",
                "domain {} image saved, {} bytes",
                domain_name(idx),
                size
            );
        }
        inner.save_done = true;
        Ok(())
    }

    fn power_down(
        &self,
        inner: &mut MemPdInner,
        idx: usize,
        dom: &'static MemPdDomain,
    ) -> WcnResult<()> {
        if !inner.save_done {
            self.save_images(inner)?;
        }
        self.close_ack[idx].reset();
        self.bus
            .reg_write(dom.close_doorbell.0, dom.close_doorbell.1)
            .map_err(WcnError::from_errno)?;
        match self.close_ack[idx].wait_for(self.ack_timeout, &self.cancel) {
            Ok(()) => {}
            Err(WaitError::Timeout) => {
                // 不敢在 CP 还占着的域上切电，保持上电并报错
                log::error!(
                    target: "wcn::bsp::mem_pd",
                    "domain {} close not acked within {}ms",
                    domain_name(idx),
                    self.ack_timeout.as_millis()
                );
                return Err(WcnError::MemDomainAckTimeout);
            }
            Err(WaitError::Cancelled) => return Err(WcnError::Cancelled),
        }
        for &(reg, mask) in dom.power_bits {
            BusRegister::new(self.bus.clone(), reg)
                .clear_bits(mask)
                .map_err(WcnError::from_errno)?;
        }
        inner.state[idx] = MemPdState::PoweredDown;
        log::info!(target: "wcn::bsp::mem_pd", "domain {} powered down", domain_name(idx));
        Ok(())
    }

    fn power_up(
        &self,
        inner: &mut MemPdInner,
        idx: usize,
        dom: &'static MemPdDomain,
    ) -> WcnResult<()> {
        for &(reg, mask) in dom.power_bits {
            BusRegister::new(self.bus.clone(), reg)
                .set_bits(mask)
                .map_err(WcnError::from_errno)?;
        }
        let Some(image) = inner.saved[idx].as_ref() else {
            return Err(WcnError::BadState("no saved image for domain"));
        };
        self.bus
            .direct_write(dom.base, image)
            .map_err(WcnError::from_errno)?;
        inner.state[idx] = MemPdState::PoweredUp;

        self.open_ack[idx].reset();
        self.bus
            .reg_write(dom.open_doorbell.0, dom.open_doorbell.1)
            .map_err(WcnError::from_errno)?;
        match self.open_ack[idx].wait_for(self.ack_timeout, &self.cancel) {
            Ok(()) => {
                log::info!(target: "wcn::bsp::mem_pd", "domain {} powered up", domain_name(idx));
                Ok(())
            }
            Err(WaitError::Timeout) => {
                // 电已给、镜像已回写，只是 CP 没把话说完
                log::error!(
                    target: "wcn::bsp::mem_pd",
                    "domain {} open not acked within {}ms",
                    domain_name(idx),
                    self.ack_timeout.as_millis()
                );
                Err(WcnError::MemDomainAckTimeout)
            }
            Err(WaitError::Cancelled) => Err(WcnError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::SleepTimeoutPolicy;
    use crate::sync::delay_ms;
    use crate::testutil::{test_config, tiny_mem_pd_profile};
    use bus::{BusOp, MemBus};

    struct Rig {
        bus: Arc<MemBus>,
        mgr: Arc<MemPdManager>,
        slp: Arc<SleepWakeManager>,
        profile: &'static ChipProfile,
    }

    fn rig() -> Rig {
        let bus = Arc::new(MemBus::new());
        let profile = tiny_mem_pd_profile();
        let shared: SharedBus = bus.clone();
        let slp = Arc::new(SleepWakeManager::new(
            shared.clone(),
            profile,
            SleepTimeoutPolicy::Strict,
            CancelToken::new(),
        ));
        let mgr = Arc::new(MemPdManager::new(
            shared,
            profile,
            slp.clone(),
            &test_config(),
            CancelToken::new(),
        ));
        // 两个域的供电位摆成“全上电”
        for dom in [profile.mem_pd_wifi.unwrap(), profile.mem_pd_bt.unwrap()] {
            for &(reg, mask) in dom.power_bits {
                let old = bus.peek_reg(reg);
                bus.preset_reg(reg, old | mask);
            }
        }
        bus.clear_journal();
        Rig { bus, mgr, slp, profile }
    }

    fn ack_later(mgr: &Arc<MemPdManager>, su: WcnSubsys, closed: bool) -> std::thread::JoinHandle<()> {
        let mgr = mgr.clone();
        std::thread::spawn(move || {
            delay_ms(15);
            if closed {
                mgr.ack_closed(su);
            } else {
                mgr.ack_opened(su);
            }
        })
    }

    #[test]
    fn probe_timeout_disables_the_feature() {
        let r = rig();
        assert_eq!(r.mgr.request(WcnSubsys::Wifi, false), Ok(()));
        // 没有门铃、没有切电，只有休眠括号的痕迹
        assert!(!r
            .bus
            .journal()
            .iter()
            .any(|op| matches!(op, BusOp::RegWrite(reg, _)
                if *reg == r.profile.mem_pd_wifi.unwrap().close_doorbell.0)));
        assert_eq!(r.mgr.state(WcnSubsys::Wifi), Some(MemPdState::PoweredUp));
    }

    #[test]
    fn non_domain_subsystems_are_noop() {
        let r = rig();
        assert_eq!(r.mgr.request(WcnSubsys::Gnss, true), Ok(()));
        assert_eq!(r.mgr.request(WcnSubsys::Fm, false), Ok(()));
        assert!(r.bus.journal().is_empty());
        assert_eq!(r.mgr.state(WcnSubsys::Gnss), None);
    }

    #[test]
    fn first_power_down_saves_both_domains_once() {
        let r = rig();
        r.mgr.remote_ready();
        let wifi = r.profile.mem_pd_wifi.unwrap();
        let bt = r.profile.mem_pd_bt.unwrap();
        r.bus.preset_ram(wifi.base, &vec![0xa5; wifi.size as usize]);
        r.bus.preset_ram(bt.base, &vec![0x5a; bt.size as usize]);

        let h = ack_later(&r.mgr, WcnSubsys::Wifi, true);
        assert_eq!(r.mgr.request(WcnSubsys::Wifi, false), Ok(()));
        h.join().unwrap();

        let reads = |j: &[BusOp]| {
            j.iter()
                .filter(|op| matches!(op, BusOp::DirectRead { .. }))
                .count()
        };
        let journal = r.bus.journal();
        assert_eq!(reads(&journal), 2);
        assert!(journal.contains(&BusOp::RegWrite(wifi.close_doorbell.0, wifi.close_doorbell.1)));
        // 供电位已清
        for &(reg, mask) in wifi.power_bits {
            assert_eq!(r.bus.peek_reg(reg) & mask, 0);
        }
        assert_eq!(r.mgr.state(WcnSubsys::Wifi), Some(MemPdState::PoweredDown));
        assert_eq!(r.mgr.state(WcnSubsys::Bluetooth), Some(MemPdState::PoweredUp));

        // 第二次断电（BT）不再读镜像
        r.bus.clear_journal();
        let h = ack_later(&r.mgr, WcnSubsys::Bluetooth, true);
        assert_eq!(r.mgr.request(WcnSubsys::Bluetooth, false), Ok(()));
        h.join().unwrap();
        assert_eq!(reads(&r.bus.journal()), 0);
    }

    #[test]
    fn power_up_restores_the_saved_image() {
        let r = rig();
        r.mgr.remote_ready();
        let wifi = r.profile.mem_pd_wifi.unwrap();
        let pattern: Vec<u8> = (0..wifi.size).map(|i| (i % 13) as u8).collect();
        r.bus.preset_ram(wifi.base, &pattern);

        let h = ack_later(&r.mgr, WcnSubsys::Wifi, true);
        r.mgr.request(WcnSubsys::Wifi, false).unwrap();
        h.join().unwrap();

        // 断电后内容就当丢了
        r.bus.preset_ram(wifi.base, &vec![0; wifi.size as usize]);

        let h = ack_later(&r.mgr, WcnSubsys::Wifi, false);
        r.mgr.request(WcnSubsys::Wifi, true).unwrap();
        h.join().unwrap();

        assert_eq!(r.bus.peek_ram(wifi.base, wifi.size as usize), pattern);
        // 供电位回来了
        for &(reg, mask) in wifi.power_bits {
            assert_eq!(r.bus.peek_reg(reg) & mask, mask);
        }
        assert!(r
            .bus
            .journal()
            .contains(&BusOp::RegWrite(wifi.open_doorbell.0, wifi.open_doorbell.1)));
        assert_eq!(r.mgr.state(WcnSubsys::Wifi), Some(MemPdState::PoweredUp));
    }

    #[test]
    fn close_ack_timeout_keeps_domain_up() {
        let r = rig();
        r.mgr.remote_ready();
        let wifi = r.profile.mem_pd_wifi.unwrap();

        assert_eq!(
            r.mgr.request(WcnSubsys::Wifi, false),
            Err(WcnError::MemDomainAckTimeout)
        );
        // 没切电
        for &(reg, mask) in wifi.power_bits {
            assert_eq!(r.bus.peek_reg(reg) & mask, mask);
        }
        assert_eq!(r.mgr.state(WcnSubsys::Wifi), Some(MemPdState::PoweredUp));
        // 重开是无动作
        r.bus.clear_journal();
        assert_eq!(r.mgr.request(WcnSubsys::Wifi, true), Ok(()));
        assert!(!r
            .bus
            .journal()
            .iter()
            .any(|op| matches!(op, BusOp::DirectWrite { .. })));
    }

    #[test]
    fn power_up_without_saved_image_is_rejected() {
        let r = rig();
        r.mgr.remote_ready();
        {
            let mut inner = plock(&r.mgr.inner);
            inner.probed = true;
            inner.supported = true;
            inner.state[DOM_WIFI] = MemPdState::PoweredDown;
        }
        assert_eq!(
            r.mgr.request(WcnSubsys::Wifi, true),
            Err(WcnError::BadState("no saved image for domain"))
        );
    }

    #[test]
    fn sleep_bracket_opens_and_closes() {
        let r = rig();
        assert_eq!(r.mgr.request(WcnSubsys::Wifi, false), Ok(()));
        // 括号收尾后没有残留唤醒源
        assert_eq!(r.slp.active_sources(), 0);
        assert_eq!(r.slp.status(), crate::export::SleepStatus::Asleep);
    }

    #[test]
    fn power_cycle_resets_domains_but_keeps_images() {
        let r = rig();
        r.mgr.remote_ready();
        let wifi = r.profile.mem_pd_wifi.unwrap();
        r.bus.preset_ram(wifi.base, &vec![0x77; wifi.size as usize]);

        let h = ack_later(&r.mgr, WcnSubsys::Wifi, true);
        r.mgr.request(WcnSubsys::Wifi, false).unwrap();
        h.join().unwrap();
        assert_eq!(r.mgr.state(WcnSubsys::Wifi), Some(MemPdState::PoweredDown));

        r.mgr.reset_for_power_off();
        assert_eq!(r.mgr.state(WcnSubsys::Wifi), Some(MemPdState::PoweredUp));
        {
            let inner = plock(&r.mgr.inner);
            assert!(inner.save_done);
            assert!(inner.saved[DOM_WIFI].is_some());
            assert!(inner.probed && inner.supported);
        }
    }
}
