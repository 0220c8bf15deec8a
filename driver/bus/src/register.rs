//! 芯片寄存器的读-改-写句柄

use crate::{SharedBus, WcnBus};

/// 绑定到单个芯片寄存器的句柄。所有位段更新都走读-改-写，不在上层代码里
/// 散落裸地址。
pub struct BusRegister {
    bus: SharedBus,
    addr: u32,
}

impl BusRegister {
    pub fn new(bus: SharedBus, addr: u32) -> Self {
        Self { bus, addr }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn read(&self) -> Result<u32, i32> {
        self.bus.reg_read(self.addr)
    }

    pub fn write(&self, val: u32) -> Result<(), i32> {
        self.bus.reg_write(self.addr, val)
    }

    /// 读-改-写：`mask` 覆盖的位替换为 `val` 中对应位，其余位保持。
    pub fn update(&self, mask: u32, val: u32) -> Result<(), i32> {
        let old = self.bus.reg_read(self.addr)?;
        let new = (old & !mask) | (val & mask);
        if new != old {
            self.bus.reg_write(self.addr, new)?;
        }
        Ok(())
    }

    pub fn set_bits(&self, bits: u32) -> Result<(), i32> {
        self.update(bits, bits)
    }

    pub fn clear_bits(&self, bits: u32) -> Result<(), i32> {
        self.update(bits, 0)
    }
}

impl core::fmt::Debug for BusRegister {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BusRegister(0x{:08x})", self.addr)
    }
}
