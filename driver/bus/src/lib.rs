//! WCN 总线传输抽象
//!
//! 宿主通过一条共享总线控制 WCN 协处理器，本 crate 只定义该总线对上层可见的
//! 最小契约：寄存器读写、大块内存直写/直读、驱动注册/注销、卡扫描与移除。
//! 物理传输（SDIO/PCIe/SIPC）的实现在各自的平台仓库中，不在此处。
//!
//! - [`WcnBus`]：传输层 trait，错误为 errno 风格 `i32`，由上层统一换型。
//! - [`BusRegister`]：单个芯片寄存器的读-改-写句柄。
//! - [`MemBus`]：内存模拟总线，带写入流水账与故障注入，用于测试与台架联调。

use std::sync::Arc;

mod membus;
mod register;

pub use membus::{BusOp, MemBus};
pub use register::BusRegister;

/// I/O 错误
pub const EIO: i32 = -5;
/// 内存不足
pub const ENOMEM: i32 = -12;
/// 设备或资源忙（重复注册）
pub const EBUSY: i32 = -16;
/// 设备不存在（未 probe 到卡）
pub const ENODEV: i32 = -19;
/// 参数非法
pub const EINVAL: i32 = -22;
/// 等待超时
pub const ETIMEDOUT: i32 = -110;

/// 卡检测回调。`register` 时安装，传输层在 `rescan` 检出卡后调用（可能在
/// 传输层自己的线程上），实现方不得在回调内再进入总线。
pub type CardDetectCb = Box<dyn Fn() + Send + Sync>;

/// WCN 总线传输契约。
///
/// 所有方法都可能阻塞；地址均为芯片侧物理地址。`direct_*` 的长度由切片长度
/// 给出，传输层内部自行分包。
pub trait WcnBus: Send + Sync {
    /// 向传输层注册驱动并安装卡检测回调。重复注册返回 `-EBUSY` 类错误码
    /// 由实现自定，上层按失败处理。
    fn register(&self, on_card_detect: CardDetectCb) -> Result<(), i32>;

    /// 注销驱动，丢弃卡检测回调。总应成功。
    fn unregister(&self);

    /// 触发一次总线重扫。异步：检出通过 `register` 安装的回调通知。
    fn rescan(&self) -> Result<(), i32>;

    /// 通知传输层卡已不可用（下电前调用）。
    fn remove_card(&self);

    /// 读 32 位芯片寄存器。
    fn reg_read(&self, addr: u32) -> Result<u32, i32>;

    /// 写 32 位芯片寄存器。
    fn reg_write(&self, addr: u32, val: u32) -> Result<(), i32>;

    /// 从芯片侧物理地址读回 `buf.len()` 字节。
    fn direct_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), i32>;

    /// 向芯片侧物理地址写入 `data` 全部字节。
    fn direct_write(&self, addr: u32, data: &[u8]) -> Result<(), i32>;
}

/// `Arc<dyn WcnBus>` 的共享别名；各组件按此持有总线。
pub type SharedBus = Arc<dyn WcnBus>;
