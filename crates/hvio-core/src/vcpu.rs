//! The slice of vCPU state the I/O path reads and writes.

use crate::error::{IoEmulError, Result};
use crate::request::{size_mask, IoAccess, IoRequest, RequestState};

/// General-purpose registers in hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
}

impl GuestRegisters {
    pub fn get(&self, reg: Gpr) -> u64 {
        self.gprs[reg as usize]
    }

    pub fn set(&mut self, reg: Gpr, value: u64) {
        self.gprs[reg as usize] = value;
    }

    /// Replaces the low `size` bytes of `reg`, keeping the rest.
    pub fn merge(&mut self, reg: Gpr, size: u8, value: u64) {
        let mask = size_mask(size);
        let old = self.get(reg);
        self.set(reg, (old & !mask) | (value & mask));
    }
}

/// How a loaded MMIO value is widened into its destination register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Extend {
    /// Plain `mov`: 1- and 2-byte loads keep the upper register bits, 4-byte loads clear the
    /// upper half.
    #[default]
    None,
    /// `movzx`.
    Zero,
    /// `movsx`.
    Sign,
}

/// Destination of an MMIO load, as decoded by the trap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioDecode {
    pub dst: Gpr,
    pub extend: Extend,
}

impl MmioDecode {
    pub fn new(dst: Gpr) -> Self {
        Self {
            dst,
            extend: Extend::None,
        }
    }

    pub fn with_extend(mut self, extend: Extend) -> Self {
        self.extend = extend;
        self
    }

    /// Writes a `size`-byte loaded value into the destination register.
    pub fn apply(&self, regs: &mut GuestRegisters, size: u8, value: u64) {
        let value = value & size_mask(size);
        match self.extend {
            Extend::None if size < 4 => regs.merge(self.dst, size, value),
            Extend::None | Extend::Zero => regs.set(self.dst, value),
            Extend::Sign => {
                let shift = 64 - u32::from(size.clamp(1, 8)) * 8;
                regs.set(self.dst, (((value << shift) as i64) >> shift) as u64);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VcpuState {
    #[default]
    Running,
    /// Waiting for a deferred I/O request.
    Paused,
    /// Being torn down; its pending I/O is discarded.
    Zombie,
}

#[derive(Debug, Clone, Default)]
pub struct Vcpu {
    vcpu_id: u16,
    state: VcpuState,
    pub regs: GuestRegisters,
    req: IoRequest,
    /// Set by the trap layer before an MMIO read is dispatched.
    pub mmio_decode: Option<MmioDecode>,
}

impl Vcpu {
    pub fn new(vcpu_id: u16) -> Self {
        Self {
            vcpu_id,
            ..Self::default()
        }
    }

    pub fn id(&self) -> u16 {
        self.vcpu_id
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn pause(&mut self) {
        if self.state == VcpuState::Running {
            self.state = VcpuState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == VcpuState::Paused {
            self.state = VcpuState::Running;
        }
    }

    /// Marks the vCPU as being torn down. There is no way back.
    pub fn make_zombie(&mut self) {
        self.state = VcpuState::Zombie;
    }

    pub fn io_request(&self) -> &IoRequest {
        &self.req
    }

    pub(crate) fn io_request_mut(&mut self) -> &mut IoRequest {
        &mut self.req
    }

    /// Loads the next access to emulate. The previous request must have been consumed.
    pub fn set_io_request(&mut self, access: IoAccess) -> Result<()> {
        if self.req.state != RequestState::Free {
            return Err(IoEmulError::RequestInFlight {
                vcpu_id: self.vcpu_id,
                state: self.req.state,
            });
        }
        self.req = IoRequest::new(access);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_upper_bytes() {
        let mut regs = GuestRegisters::default();
        regs.set(Gpr::Rax, 0x1122_3344_5566_7788);
        regs.merge(Gpr::Rax, 1, 0xAB);
        assert_eq!(regs.get(Gpr::Rax), 0x1122_3344_5566_77AB);
        regs.merge(Gpr::Rax, 4, 0xFFFF_FFFF_0000_0000);
        assert_eq!(regs.get(Gpr::Rax), 0x1122_3344_0000_0000);
    }

    #[test]
    fn mmio_decode_widening() {
        let mut regs = GuestRegisters::default();
        regs.set(Gpr::Rbx, u64::MAX);

        MmioDecode::new(Gpr::Rbx).apply(&mut regs, 2, 0x8001);
        assert_eq!(regs.get(Gpr::Rbx), 0xFFFF_FFFF_FFFF_8001);

        MmioDecode::new(Gpr::Rbx).apply(&mut regs, 4, 0x8000_0001);
        assert_eq!(regs.get(Gpr::Rbx), 0x8000_0001);

        MmioDecode::new(Gpr::Rbx)
            .with_extend(Extend::Sign)
            .apply(&mut regs, 1, 0x80);
        assert_eq!(regs.get(Gpr::Rbx), 0xFFFF_FFFF_FFFF_FF80);

        MmioDecode::new(Gpr::Rbx)
            .with_extend(Extend::Zero)
            .apply(&mut regs, 1, 0x180);
        assert_eq!(regs.get(Gpr::Rbx), 0x80);

        MmioDecode::new(Gpr::R15).apply(&mut regs, 8, 0x0123_4567_89AB_CDEF);
        assert_eq!(regs.get(Gpr::R15), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn set_io_request_requires_a_consumed_request() {
        let mut vcpu = Vcpu::new(2);
        vcpu.set_io_request(IoAccess::pio_read(0x60, 1)).unwrap();
        vcpu.io_request_mut().state = RequestState::Pending;
        assert_eq!(
            vcpu.set_io_request(IoAccess::pio_read(0x64, 1)),
            Err(IoEmulError::RequestInFlight {
                vcpu_id: 2,
                state: RequestState::Pending
            })
        );
    }

    #[test]
    fn zombie_is_terminal() {
        let mut vcpu = Vcpu::new(0);
        vcpu.pause();
        assert_eq!(vcpu.state(), VcpuState::Paused);
        vcpu.make_zombie();
        vcpu.resume();
        vcpu.pause();
        assert_eq!(vcpu.state(), VcpuState::Zombie);
    }
}
