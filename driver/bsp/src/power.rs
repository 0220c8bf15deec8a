//! 上下电序列
//!
//! 时钟、电源轨、chip_en/reset 两个 GPIO 的拉起与放平，以及上电后的
//! 总线重扫与检卡等待。次序是硬约束：32K 时钟先行，复位压低后再给
//! 数字电，chip_en 拉高等 20ms 才放复位，模拟轨最后。下电严格倒放。
//!
//! 单条轨失败只记告警不中断（个别板子的轨由 PMIC 常开，句柄拿不到），
//! 检不到卡才算上电失败。

use std::sync::Arc;
use std::time::Duration;

use bus::SharedBus;

use crate::error::{WcnError, WcnResult};
use crate::export::WcnConfig;
use crate::sync::{delay_ms, CancelToken, Completion, WaitError};

/// 板级硬件操作。编号即板级描述里的时钟/电源轨/GPIO 号。
pub trait PlatformHw: Send + Sync {
    fn clock_enable(&self, id: u32) -> Result<(), i32>;
    fn clock_disable(&self, id: u32) -> Result<(), i32>;
    fn regulator_enable(&self, id: u32) -> Result<(), i32>;
    fn regulator_disable(&self, id: u32) -> Result<(), i32>;
    fn gpio_set(&self, gpio: u32, high: bool) -> Result<(), i32>;
}

/// 上下电执行者。chip_en 脚带共享计数：多方请求时第一个拉高、
/// 全下电时强制拉低清零。
pub struct PowerSequencer {
    hw: Arc<dyn PlatformHw>,
    bus: SharedBus,
    chip_en_gpio: u32,
    reset_gpio: u32,
    dvdd12: Option<u32>,
    avdd12: Option<u32>,
    avdd18: Option<u32>,
    avdd33: Option<u32>,
    clk_32k: Option<u32>,
    card_detect_timeout: Duration,
    chip_en_count: spin::Mutex<u32>,
    card_detect: Completion<()>,
    cancel: CancelToken,
}

/// 复位/使能切换后的硬件沉降时间。
const SETTLE_MS: u64 = 20;

impl PowerSequencer {
    pub fn new(
        hw: Arc<dyn PlatformHw>,
        bus: SharedBus,
        cfg: &WcnConfig,
        cancel: CancelToken,
    ) -> WcnResult<Self> {
        let chip_en_gpio = cfg
            .chip_en_gpio
            .ok_or(WcnError::Config("chip_en_gpio not set"))?;
        let reset_gpio = cfg
            .reset_gpio
            .ok_or(WcnError::Config("reset_gpio not set"))?;
        Ok(Self {
            hw,
            bus,
            chip_en_gpio,
            reset_gpio,
            dvdd12: cfg.dvdd12,
            avdd12: cfg.avdd12,
            avdd18: cfg.avdd18,
            avdd33: cfg.avdd33,
            clk_32k: cfg.clk_32k,
            card_detect_timeout: Duration::from_millis(cfg.card_detect_timeout_ms),
            chip_en_count: spin::Mutex::new(0),
            card_detect: Completion::new(),
            cancel,
        })
    }

    /// 单条轨的尽力而为执行，失败记告警继续。
    fn rail(&self, what: &str, r: Result<(), i32>) {
        if let Err(errno) = r {
            log::warn!(target: "wcn::bsp", "{} failed (errno {}), keep going", what, errno);
        }
    }

    /// chip_en 共享计数 +1，0→1 时拉高。
    pub fn chip_en_acquire(&self) {
        let mut count = self.chip_en_count.lock();
        *count += 1;
        if *count == 1 {
            self.rail("chip_en high", self.hw.gpio_set(self.chip_en_gpio, true));
        }
    }

    /// chip_en 共享计数 -1，1→0 时拉低。
    pub fn chip_en_release(&self) {
        let mut count = self.chip_en_count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.rail("chip_en low", self.hw.gpio_set(self.chip_en_gpio, false));
        }
    }

    /// 全序列上电并等待总线检出卡。
    ///
    /// 轨级失败不中断；注册/重扫失败与检卡超时返回错误，此时已拉起的
    /// 轨保持原样，由调用方的回滚统一下电。
    pub fn power_on(&self) -> WcnResult<()> {
        log::info!(target: "wcn::bsp", "chip power on");
        if let Some(clk) = self.clk_32k {
            self.rail("clk_32k enable", self.hw.clock_enable(clk));
        }
        self.rail("reset low", self.hw.gpio_set(self.reset_gpio, false));
        if let Some(r) = self.dvdd12 {
            self.rail("dvdd12 enable", self.hw.regulator_enable(r));
        }
        self.chip_en_acquire();
        delay_ms(SETTLE_MS);
        self.rail("reset high", self.hw.gpio_set(self.reset_gpio, true));
        delay_ms(SETTLE_MS);
        if let Some(r) = self.avdd12 {
            self.rail("avdd12 enable", self.hw.regulator_enable(r));
        }
        if let Some(r) = self.avdd18 {
            self.rail("avdd18 enable", self.hw.regulator_enable(r));
        }
        if let Some(r) = self.avdd33 {
            self.rail("avdd33 enable", self.hw.regulator_enable(r));
        }

        self.card_detect.reset();
        let detected = self.card_detect.clone();
        self.bus
            .register(Box::new(move || detected.complete(())))
            .map_err(WcnError::from_errno)?;
        if let Err(errno) = self.bus.rescan() {
            self.bus.unregister();
            return Err(WcnError::from_errno(errno));
        }
        match self
            .card_detect
            .wait_for(self.card_detect_timeout, &self.cancel)
        {
            Ok(()) => {
                log::info!(target: "wcn::bsp", "card detected, bus ready");
                Ok(())
            }
            Err(WaitError::Timeout) => {
                log::error!(
                    target: "wcn::bsp",
                    "no card detected within {}ms after rescan",
                    self.card_detect_timeout.as_millis()
                );
                Err(WcnError::CardDetectTimeout)
            }
            Err(WaitError::Cancelled) => Err(WcnError::Cancelled),
        }
    }

    /// 全序列下电（上电的严格逆序），并把 chip_en 计数清零。
    pub fn power_off(&self) {
        log::info!(target: "wcn::bsp", "chip power off");
        self.bus.remove_card();
        self.bus.unregister();
        if let Some(r) = self.avdd33 {
            self.rail("avdd33 disable", self.hw.regulator_disable(r));
        }
        if let Some(r) = self.avdd18 {
            self.rail("avdd18 disable", self.hw.regulator_disable(r));
        }
        if let Some(r) = self.avdd12 {
            self.rail("avdd12 disable", self.hw.regulator_disable(r));
        }
        self.rail("reset low", self.hw.gpio_set(self.reset_gpio, false));
        {
            let mut count = self.chip_en_count.lock();
            if *count != 0 {
                *count = 0;
                self.rail("chip_en low", self.hw.gpio_set(self.chip_en_gpio, false));
            }
        }
        if let Some(r) = self.dvdd12 {
            self.rail("dvdd12 disable", self.hw.regulator_disable(r));
        }
        if let Some(clk) = self.clk_32k {
            self.rail("clk_32k disable", self.hw.clock_disable(clk));
        }
    }
}
