//! 测试公共件：桩硬件、台架配置、固件容器构造与微缩芯片档案。

use std::sync::Mutex as StdMutex;

use crate::chip::{profile_for, ChipFamily, ChipProfile, MemPdDomain};
use crate::export::WcnConfig;
use crate::power::PlatformHw;

/// 记录每次调用的桩硬件。编号直接进日志串，测试按串比对次序。
pub(crate) struct MockHw {
    log: StdMutex<Vec<String>>,
    fail_regulators: StdMutex<Vec<u32>>,
}

impl MockHw {
    pub(crate) fn new() -> Self {
        Self {
            log: StdMutex::new(Vec::new()),
            fail_regulators: StdMutex::new(Vec::new()),
        }
    }

    /// 指定编号的电源轨从此使能失败。
    pub(crate) fn fail_regulator(&self, id: u32) {
        self.fail_regulators.lock().unwrap().push(id);
    }

    /// 取走并清空调用日志。
    pub(crate) fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl PlatformHw for MockHw {
    fn clock_enable(&self, id: u32) -> Result<(), i32> {
        self.record(format!("clk_en {}", id));
        Ok(())
    }

    fn clock_disable(&self, id: u32) -> Result<(), i32> {
        self.record(format!("clk_dis {}", id));
        Ok(())
    }

    fn regulator_enable(&self, id: u32) -> Result<(), i32> {
        if self.fail_regulators.lock().unwrap().contains(&id) {
            return Err(bus::EIO);
        }
        self.record(format!("reg_en {}", id));
        Ok(())
    }

    fn regulator_disable(&self, id: u32) -> Result<(), i32> {
        self.record(format!("reg_dis {}", id));
        Ok(())
    }

    fn gpio_set(&self, gpio: u32, high: bool) -> Result<(), i32> {
        self.record(format!("gpio {} {}", gpio, if high { "high" } else { "low" }));
        Ok(())
    }
}

/// 台架基准配置：引脚/轨全配齐，各超时压到毫秒级，不扫分区。
pub(crate) fn test_config() -> WcnConfig {
    WcnConfig {
        chip_en_gpio: Some(10),
        reset_gpio: Some(11),
        dvdd12: Some(1),
        avdd12: Some(2),
        avdd18: Some(3),
        avdd33: Some(4),
        clk_32k: Some(9),
        firmware_search_paths: Vec::new(),
        card_detect_timeout_ms: 30,
        mem_pd_probe_timeout_ms: Some(5),
        mem_pd_ack_timeout_ms: Some(50),
        fw_open_retry_delay_ms: 1,
        skip_readiness_wait: true,
        ..WcnConfig::default()
    }
}

/// 组一个多版型固件容器：`WCNM` 头 + 目录 + 子镜像按给定次序排布。
pub(crate) fn fw_container(images: &[([u8; 4], &[u8])]) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(&crate::firmware::IMG_HEAD_MAGIC);
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&(images.len() as u32).to_le_bytes());
    let mut offset = (12 + images.len() * 12) as u32;
    for (tag, data) in images {
        blob.extend_from_slice(tag);
        blob.extend_from_slice(&offset.to_le_bytes());
        blob.extend_from_slice(&(data.len() as u32).to_le_bytes());
        offset += data.len() as u32;
    }
    for (_, data) in images {
        blob.extend_from_slice(data);
    }
    blob
}

/// 带微缩内存电域的 Marlin3 档案副本，域只有几十字节，镜像搬运即时完成。
pub(crate) fn tiny_mem_pd_profile() -> &'static ChipProfile {
    let mut p = *profile_for(ChipFamily::Marlin3);
    p.mem_pd_wifi = Some(MemPdDomain {
        base: 0x4000,
        size: 64,
        power_bits: &[(0x100, 0x0000_0003), (0x104, 0x0000_00f0)],
        close_doorbell: (0x110, 0x10),
        open_doorbell: (0x114, 0x01),
    });
    p.mem_pd_bt = Some(MemPdDomain {
        base: 0x5000,
        size: 32,
        power_bits: &[(0x100, 0x0000_000c)],
        close_doorbell: (0x110, 0x20),
        open_doorbell: (0x114, 0x02),
    });
    Box::leak(Box::new(p))
}
