//! 对外公共词汇表
//!
//! 子系统编号与位图、休眠/电域状态、事件类型以及 attach 配置。位图是全局
//! 开关计数的唯一真相：每个子系统一位，置位表示该子系统被打开。

use std::path::PathBuf;

use crate::chip::ChipFamily;
use crate::error::WcnError;

/// WCN 子系统。前五个是真实子系统，`Auto` 是 attach 后首启的内部占位者，
/// `All` 是全部真实子系统的并集写法。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WcnSubsys {
    Bluetooth = 0,
    Fm = 1,
    Wifi = 2,
    Mdbg = 3,
    Gnss = 4,
    Auto = 5,
    All = 6,
}

/// BTWF 核四个子系统的位集合。
pub const BTWF_MASK: u32 = 0x0f;
/// GNSS 子系统位。
pub const GNSS_MASK: u32 = 1 << 4;
/// 首启占位位。
pub const AUTO_MASK: u32 = 1 << 5;
/// 全部真实子系统（不含 Auto）。
pub const REAL_MASK: u32 = BTWF_MASK | GNSS_MASK;

impl WcnSubsys {
    /// 该子系统在位图中的位集合。`All` 展开为全部真实位。
    pub const fn bits(self) -> u32 {
        match self {
            WcnSubsys::Bluetooth => 1 << 0,
            WcnSubsys::Fm => 1 << 1,
            WcnSubsys::Wifi => 1 << 2,
            WcnSubsys::Mdbg => 1 << 3,
            WcnSubsys::Gnss => GNSS_MASK,
            WcnSubsys::Auto => AUTO_MASK,
            WcnSubsys::All => REAL_MASK,
        }
    }

    /// 是否属于 BTWF 核。
    pub const fn is_btwf(self) -> bool {
        matches!(
            self,
            WcnSubsys::Bluetooth | WcnSubsys::Fm | WcnSubsys::Wifi | WcnSubsys::Mdbg
        )
    }

    /// 由位序号还原真实子系统（Auto/All 不参与）。
    pub const fn from_bit(bit: u32) -> Option<WcnSubsys> {
        match bit {
            0 => Some(WcnSubsys::Bluetooth),
            1 => Some(WcnSubsys::Fm),
            2 => Some(WcnSubsys::Wifi),
            3 => Some(WcnSubsys::Mdbg),
            4 => Some(WcnSubsys::Gnss),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            WcnSubsys::Bluetooth => "bt",
            WcnSubsys::Fm => "fm",
            WcnSubsys::Wifi => "wifi",
            WcnSubsys::Mdbg => "mdbg",
            WcnSubsys::Gnss => "gnss",
            WcnSubsys::Auto => "auto",
            WcnSubsys::All => "all",
        }
    }
}

/// 片上 CP 核。BTWF 跑蓝牙/FM/WiFi/调试代理，GNSS 单独一核。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpCore {
    Btwf,
    Gnss,
}

impl CpCore {
    pub const fn name(self) -> &'static str {
        match self {
            CpCore::Btwf => "btwf",
            CpCore::Gnss => "gnss",
        }
    }
}

/// 芯片休眠状态（宿主视角的握手结论，不是芯片内部真值）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepStatus {
    Awake,
    Waking,
    Asleep,
}

/// 内存电域状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemPdState {
    PoweredDown,
    PoweredUp,
}

/// 唤醒轮询耗尽后的处置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepTimeoutPolicy {
    /// 记告警后当作已醒继续（缺省；个别批次芯片不回状态字但实际已醒）。
    AssumeAwake,
    /// 返回 [`WcnError::SleepWakeTimeout`]，由调用方决定重试或放弃。
    Strict,
}

/// 存活提示：位图变为恰好一个真实子系统、或归零时发出。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessHint {
    Single(WcnSubsys),
    Empty,
}

/// 生命周期事件，经 attach 时安装的回调送出。
#[derive(Clone, Debug, PartialEq)]
pub enum WcnEvent {
    /// 芯片整体上/下电翻转，附当时位图。
    PowerStateChanged { powered: bool, bitmap: u32 },
    Liveness(LivenessHint),
    /// 启动序列失败（超时、总线错误等），发出前已回滚完毕。
    BootError(WcnError),
}

/// 事件回调。在驱动自身线程上调用，回调内不得再进入控制器接口。
pub type EventCallback = Box<dyn Fn(&WcnEvent) + Send + Sync>;

/// attach 配置。GPIO/时钟/电源轨编号来自板级描述，`None` 表示该板没有
/// 这条轨（常开或板上自理）；两个 GPIO 是硬要求。
#[derive(Clone, Debug)]
pub struct WcnConfig {
    pub family: ChipFamily,
    /// 芯片使能脚（多方共享，计数拉高/拉低）。
    pub chip_en_gpio: Option<u32>,
    /// 复位脚。
    pub reset_gpio: Option<u32>,
    pub dvdd12: Option<u32>,
    pub avdd12: Option<u32>,
    pub avdd18: Option<u32>,
    pub avdd33: Option<u32>,
    pub clk_32k: Option<u32>,
    /// 调试开关：位图归零时保持芯片供电，后续 close 只做记账。
    pub no_power_off: bool,
    /// 跳过冷启动前的外部就绪会合（台架上没有电源协调方时用）。
    pub skip_readiness_wait: bool,
    pub btwf_firmware: String,
    pub gnss_firmware: String,
    /// 镜像搜索目录，按序尝试 `目录/镜像名`。
    pub firmware_search_paths: Vec<PathBuf>,
    /// 覆盖芯片档案里的下载超时（毫秒）。
    pub gnss_boot_timeout_ms: Option<u64>,
    pub btwf_boot_timeout_ms: Option<u64>,
    pub card_detect_timeout_ms: u64,
    pub readiness_wait_ms: u64,
    pub mem_pd_probe_timeout_ms: Option<u64>,
    pub mem_pd_ack_timeout_ms: Option<u64>,
    pub sleep_timeout_policy: SleepTimeoutPolicy,
    /// attach 后延迟首启（毫秒）；`None` 关闭自动首启，由上层自行触发。
    pub auto_boot_delay_ms: Option<u64>,
    /// 覆写 BTWF 镜像前 8 字节的功能掩码（告知 CP 启用哪些功能块）。
    pub btwf_function_mask: [u8; 8],
    /// 镜像打开失败的重试间隔（毫秒）。启动早期分区节点可能尚未就绪。
    pub fw_open_retry_delay_ms: u64,
}

impl Default for WcnConfig {
    fn default() -> Self {
        Self {
            family: ChipFamily::Marlin3,
            chip_en_gpio: None,
            reset_gpio: None,
            dvdd12: None,
            avdd12: None,
            avdd18: None,
            avdd33: None,
            clk_32k: None,
            no_power_off: false,
            skip_readiness_wait: false,
            btwf_firmware: "wcnmodem".into(),
            gnss_firmware: "gnssmodem".into(),
            firmware_search_paths: vec![
                PathBuf::from("/dev/block/by-name"),
                PathBuf::from("/lib/firmware"),
            ],
            gnss_boot_timeout_ms: None,
            btwf_boot_timeout_ms: None,
            card_detect_timeout_ms: 3000,
            readiness_wait_ms: 3000,
            mem_pd_probe_timeout_ms: None,
            mem_pd_ack_timeout_ms: None,
            sleep_timeout_policy: SleepTimeoutPolicy::AssumeAwake,
            auto_boot_delay_ms: None,
            btwf_function_mask: [0; 8],
            fw_open_retry_delay_ms: 1000,
        }
    }
}

impl WcnConfig {
    /// attach 前的配置体检，缺硬件描述直接拒绝。
    pub fn validate(&self) -> Result<(), WcnError> {
        if self.chip_en_gpio.is_none() {
            return Err(WcnError::Config("chip_en_gpio not set"));
        }
        if self.reset_gpio.is_none() {
            return Err(WcnError::Config("reset_gpio not set"));
        }
        if self.btwf_firmware.is_empty() {
            return Err(WcnError::Config("btwf_firmware name empty"));
        }
        if self.gnss_firmware.is_empty() {
            return Err(WcnError::Config("gnss_firmware name empty"));
        }
        Ok(())
    }
}
