//! marlin WCN 组合芯片驱动
//!
//! UNISOC marlin 系列 BT/FM/WiFi/GNSS 组合芯片的生命周期管理：
//! - bus: 传输总线接口与测试用内存总线
//! - bsp: 上下电序列、固件下载、启动协调、休眠唤醒、内存电域
//!
//! 平台侧实现 [`bsp::PlatformHw`] 与 [`bus::WcnBus`] 后，经
//! [`bsp::WcnController::attach`] 装上芯片；各子系统驱动拿同一个控制器
//! 按位图开关自己。

pub use bsp;
pub use bus;

pub use bsp::{
    BootState, EventCallback, PlatformHw, WcnConfig, WcnController, WcnError, WcnEvent, WcnResult,
    WcnSubsys,
};
