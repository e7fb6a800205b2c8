//! VM-exit entry point for `IN`/`OUT` instructions.

use crate::dispatch::{emulate_io, IoResolution};
use crate::error::{IoEmulError, Result};
use crate::post::emulate_pio_post;
use crate::request::{size_mask, IoAccess};
use crate::vcpu::{Gpr, Vcpu};
use crate::vm::Vm;

/// Exit information the trap layer reads from the VMCS for an I/O instruction exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoExitInfo {
    pub qualification: u64,
    /// Length of the trapping instruction in bytes.
    pub inst_len: u8,
}

impl IoExitInfo {
    const SIZE_MASK: u64 = 0x7;
    const DIRECTION_IN: u64 = 1 << 3;
    const STRING: u64 = 1 << 4;
    const REP: u64 = 1 << 5;
    const PORT_SHIFT: u32 = 16;

    /// Builds the qualification the hardware would report for a plain `IN`/`OUT`.
    pub fn new(port: u16, size: u8, is_in: bool, inst_len: u8) -> Self {
        let mut qualification = (u64::from(port) << Self::PORT_SHIFT)
            | (u64::from(size.saturating_sub(1)) & Self::SIZE_MASK);
        if is_in {
            qualification |= Self::DIRECTION_IN;
        }
        Self {
            qualification,
            inst_len,
        }
    }

    pub fn size(&self) -> u8 {
        (self.qualification & Self::SIZE_MASK) as u8 + 1
    }

    pub fn is_in(&self) -> bool {
        self.qualification & Self::DIRECTION_IN != 0
    }

    pub fn is_string(&self) -> bool {
        self.qualification & Self::STRING != 0
    }

    pub fn is_rep(&self) -> bool {
        self.qualification & Self::REP != 0
    }

    pub fn port(&self) -> u16 {
        (self.qualification >> Self::PORT_SHIFT) as u16
    }
}

/// What the vCPU loop should do after handling an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExitAction {
    /// Re-enter the guest.
    Resume,
    /// The vCPU is paused until its request is post-processed.
    Suspend,
}

/// Handles an I/O instruction exit.
///
/// A port the VM may access directly is resumed untouched, so the instruction re-executes
/// against hardware. Otherwise the access is emulated and RIP moves past the instruction.
pub fn pio_instr_vmexit_handler(
    vm: &Vm,
    vcpu: &mut Vcpu,
    exit: IoExitInfo,
) -> Result<VmExitAction> {
    if exit.is_string() || exit.is_rep() {
        tracing::warn!(
            vm_id = vm.id(),
            vcpu_id = vcpu.id(),
            port = exit.port(),
            "string port I/O is not emulated"
        );
        return Err(IoEmulError::InvalidArgument("string port I/O"));
    }
    let (port, size) = (exit.port(), exit.size());
    if !matches!(size, 1 | 2 | 4) {
        return Err(IoEmulError::InvalidArgument("port I/O size must be 1, 2 or 4"));
    }
    if vm.is_pio_passthrough(port, size) {
        return Ok(VmExitAction::Resume);
    }

    let access = if exit.is_in() {
        IoAccess::pio_read(port, size)
    } else {
        let value = vcpu.regs.get(Gpr::Rax) & size_mask(size);
        IoAccess::pio_write(port, size, value as u32)
    };
    vcpu.set_io_request(access)?;

    let action = match emulate_io(vm, vcpu)? {
        IoResolution::Completed => {
            emulate_pio_post(vcpu)?;
            VmExitAction::Resume
        }
        IoResolution::Deferred(_) => {
            vcpu.pause();
            VmExitAction::Suspend
        }
    };
    vcpu.regs.rip = vcpu.regs.rip.wrapping_add(u64::from(exit.inst_len));
    Ok(action)
}
