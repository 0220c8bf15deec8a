//! WCN 驱动错误类型
//!
//! 总线层的 errno 在进入本 crate 的公开接口前统一换型为 [`WcnError`]，
//! 原始错误码保留在 `BusIo` 里便于排障。

use core::fmt;

/// WCN 生命周期操作的失败原因。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WcnError {
    /// 总线读写失败，携带传输层的 errno。
    BusIo { errno: i32 },
    /// GNSS 固件下载/启动超时。
    GnssBootTimeout,
    /// BTWF 固件下载/启动超时。
    BtwfBootTimeout,
    /// 唤醒握手在限定轮询次数内未确认。
    SleepWakeTimeout,
    /// 内存电域开/关未等到 CP 应答。
    MemDomainAckTimeout,
    /// 上电后总线重扫未检出卡。
    CardDetectTimeout,
    /// 固件镜像既不在登记表中也不在任何分区路径下。
    FirmwareMissing,
    /// 固件容器损坏或没有匹配当前芯片版本的子镜像。
    FirmwareFormat(&'static str),
    /// 固件缓冲等大块内存申请失败。
    ResourceAlloc,
    /// 配置缺项或自相矛盾，attach 阶段拒绝。
    Config(&'static str),
    /// 当前状态下不允许该操作。
    BadState(&'static str),
    /// 控制器正在拆除，操作被取消。
    Cancelled,
}

impl WcnError {
    /// 总线 errno 换型入口。
    pub fn from_errno(errno: i32) -> Self {
        WcnError::BusIo { errno }
    }
}

impl fmt::Display for WcnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcnError::BusIo { errno } => write!(f, "bus i/o failed (errno {})", errno),
            WcnError::GnssBootTimeout => write!(f, "gnss core boot timed out"),
            WcnError::BtwfBootTimeout => write!(f, "btwf core boot timed out"),
            WcnError::SleepWakeTimeout => write!(f, "chip wakeup handshake timed out"),
            WcnError::MemDomainAckTimeout => write!(f, "memory power domain ack timed out"),
            WcnError::CardDetectTimeout => write!(f, "no card detected after power on"),
            WcnError::FirmwareMissing => write!(f, "firmware image not found"),
            WcnError::FirmwareFormat(what) => write!(f, "bad firmware image: {}", what),
            WcnError::ResourceAlloc => write!(f, "resource allocation failed"),
            WcnError::Config(what) => write!(f, "invalid config: {}", what),
            WcnError::BadState(what) => write!(f, "operation not allowed: {}", what),
            WcnError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for WcnError {}

pub type WcnResult<T> = Result<T, WcnError>;
