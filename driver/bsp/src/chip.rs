//! 芯片档案
//!
//! 把各家族 WCN 芯片的装载基址、复位/休眠/电域寄存器和超时参数收进一张
//! 静态表，流程代码只认 [`ChipProfile`]，不内嵌任何裸地址。换芯片只改表。

use crate::export::CpCore;

/// 受支持的芯片家族。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipFamily {
    /// SoC 内集成的 WCN 子系统。
    Integrated,
    Marlin3,
    Marlin3Lite,
    Marlin3E,
}

impl ChipFamily {
    pub const fn name(self) -> &'static str {
        match self {
            ChipFamily::Integrated => "integrated",
            ChipFamily::Marlin3 => "marlin3",
            ChipFamily::Marlin3Lite => "marlin3lite",
            ChipFamily::Marlin3E => "marlin3e",
        }
    }
}

/// 一个可断电的 CP 内存域（WiFi / BT 各一个）。
///
/// `power_bits` 列出控制该域供电的 (寄存器, 位集合)：全部置位为上电，
/// 清零为断电。开/关前后用门铃寄存器知会 CP，等它搬完数据回应答。
#[derive(Clone, Copy, Debug)]
pub struct MemPdDomain {
    /// 域在芯片地址空间的起始。
    pub base: u32,
    pub size: u32,
    pub power_bits: &'static [(u32, u32)],
    /// 断电门铃 (寄存器, 写入值)。
    pub close_doorbell: (u32, u32),
    /// 上电门铃 (寄存器, 写入值)。
    pub open_doorbell: (u32, u32),
}

/// 单个芯片家族的全部硬件参数。
#[derive(Clone, Copy, Debug)]
pub struct ChipProfile {
    pub family: ChipFamily,
    /// 固件下载分包大小（字节）。
    pub packet_size: usize,
    /// BTWF 核固件装载基址与装载窗大小。
    pub cp_start_addr: u32,
    pub firmware_max_size: u32,
    pub gnss_cp_start_addr: u32,
    pub gnss_firmware_max_size: u32,
    /// CP 复位寄存器；清掉 release 位后核开跑。
    pub cp_reset_reg: u32,
    pub cp_reset_release_bits: u32,
    pub gnss_cp_reset_reg: u32,
    pub gnss_cp_reset_release_bits: u32,
    /// 芯片版本号寄存器，容器镜像按版本选片。
    pub chipid_reg: u32,
    /// AA 版芯片 ID（高 16 位比对）。
    pub chipid_aa: u32,
    /// 唤醒请求寄存器与位。
    pub wakeup_reg: u32,
    pub wakeup_bit: u32,
    /// 允许休眠寄存器与位。
    pub slp_ctl_reg: u32,
    pub slp_allow_bits: u32,
    /// 休眠状态寄存器；`slp_sts_mask` 取出状态码。
    pub slp_sts_reg: u32,
    pub slp_sts_mask: u32,
    /// 状态码：完全清醒。
    pub slp_awake_code: u32,
    /// 状态码：尚在途中（深睡晶振已起 / PLL 锁定中），继续轮询。
    pub slp_waking_codes: [u32; 2],
    pub wake_poll_interval_ms: u64,
    pub wake_poll_retries: u32,
    pub gnss_boot_timeout_ms: u64,
    pub btwf_boot_timeout_ms: u64,
    /// 电域能力探测等待；超时视为该芯片不支持分域断电。
    pub mem_pd_probe_timeout_ms: u64,
    /// 电域开/关等 CP 应答的上限。CP 搬内存最慢要二十多秒。
    pub mem_pd_ack_timeout_ms: u64,
    pub mem_pd_wifi: Option<MemPdDomain>,
    pub mem_pd_bt: Option<MemPdDomain>,
    /// GNSS 时钟选择寄存器；清掉 sel 位切回真时钟源。
    pub gnss_fake_cfg_reg: u32,
    pub gnss_fake_sel_bits: u32,
    /// GNSS 电域控制寄存器与强制深睡/自动断电位。
    pub gnss_pd_cfg_reg: u32,
    pub gnss_force_sleep_bits: u32,
}

impl ChipProfile {
    pub const fn load_base(&self, core: CpCore) -> u32 {
        match core {
            CpCore::Btwf => self.cp_start_addr,
            CpCore::Gnss => self.gnss_cp_start_addr,
        }
    }

    pub const fn load_limit(&self, core: CpCore) -> u32 {
        match core {
            CpCore::Btwf => self.firmware_max_size,
            CpCore::Gnss => self.gnss_firmware_max_size,
        }
    }

    pub const fn reset_reg(&self, core: CpCore) -> (u32, u32) {
        match core {
            CpCore::Btwf => (self.cp_reset_reg, self.cp_reset_release_bits),
            CpCore::Gnss => (self.gnss_cp_reset_reg, self.gnss_cp_reset_release_bits),
        }
    }
}

const MARLIN3: ChipProfile = ChipProfile {
    family: ChipFamily::Marlin3,
    packet_size: 32 * 1024,
    cp_start_addr: 0x4050_0000,
    firmware_max_size: 0x0010_0000,
    gnss_cp_start_addr: 0x40a2_0000,
    gnss_firmware_max_size: 0x0005_8000,
    cp_reset_reg: 0x4088_0280,
    cp_reset_release_bits: 0x1,
    gnss_cp_reset_reg: 0x4088_0284,
    gnss_cp_reset_release_bits: 0x1,
    chipid_reg: 0x6030_03fc,
    chipid_aa: 0x2349_0000,
    wakeup_reg: 0x6030_0150,
    wakeup_bit: 0x1,
    slp_ctl_reg: 0x6030_0154,
    slp_allow_bits: 0x1,
    slp_sts_reg: 0x6030_0158,
    slp_sts_mask: 0xf0,
    slp_awake_code: 0x00,
    slp_waking_codes: [0x30, 0x70],
    wake_poll_interval_ms: 10,
    wake_poll_retries: 30,
    gnss_boot_timeout_ms: 10_000,
    btwf_boot_timeout_ms: 10_000,
    mem_pd_probe_timeout_ms: 2_000,
    mem_pd_ack_timeout_ms: 30_000,
    mem_pd_wifi: Some(MemPdDomain {
        base: 0x4056_8000,
        size: 0x0008_4000,
        power_bits: &[(0x4088_015c, 0xe000_0000), (0x4088_0164, 0x000f_0000)],
        close_doorbell: (0x4088_01b0, 0x10),
        open_doorbell: (0x4088_01b4, 0x01),
    }),
    mem_pd_bt: Some(MemPdDomain {
        base: 0x4052_8000,
        size: 0x0003_8000,
        power_bits: &[(0x4088_015c, 0x0fe0_0000)],
        close_doorbell: (0x4088_01b0, 0x20),
        open_doorbell: (0x4088_01b4, 0x02),
    }),
    gnss_fake_cfg_reg: 0x4088_0310,
    gnss_fake_sel_bits: 0x3,
    gnss_pd_cfg_reg: 0x4088_0314,
    gnss_force_sleep_bits: 0x0300_0000,
};

const MARLIN3_LITE: ChipProfile = ChipProfile {
    family: ChipFamily::Marlin3Lite,
    gnss_cp_start_addr: 0x40a5_0000,
    cp_reset_reg: 0x4088_0290,
    gnss_cp_reset_reg: 0x4088_0294,
    // lite 批次不分域断电
    mem_pd_wifi: None,
    mem_pd_bt: None,
    ..MARLIN3
};

const MARLIN3E: ChipProfile = ChipProfile {
    family: ChipFamily::Marlin3E,
    chipid_aa: 0x2355_0000,
    gnss_cp_start_addr: 0x40b0_0000,
    slp_sts_reg: 0x6030_0160,
    ..MARLIN3
};

const INTEGRATED: ChipProfile = ChipProfile {
    family: ChipFamily::Integrated,
    cp_start_addr: 0x8814_0000,
    gnss_cp_start_addr: 0x8850_0000,
    cp_reset_reg: 0x402b_00cc,
    gnss_cp_reset_reg: 0x402b_00d0,
    chipid_reg: 0x402e_00fc,
    wakeup_reg: 0x402b_0248,
    slp_ctl_reg: 0x402b_024c,
    slp_sts_reg: 0x402b_0250,
    mem_pd_wifi: None,
    mem_pd_bt: None,
    ..MARLIN3
};

/// 取家族档案。表是静态的，流程层全程只持 `&'static`。
pub fn profile_for(family: ChipFamily) -> &'static ChipProfile {
    match family {
        ChipFamily::Integrated => &INTEGRATED,
        ChipFamily::Marlin3 => &MARLIN3,
        ChipFamily::Marlin3Lite => &MARLIN3_LITE,
        ChipFamily::Marlin3E => &MARLIN3E,
    }
}
