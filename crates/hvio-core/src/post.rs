//! Completion: copying results back into guest-visible state and releasing requests.

use crate::error::{IoEmulError, Result};
use crate::request::{Direction, IoAccess, IoRequest, RequestState, RequestType};
use crate::vcpu::{Gpr, Vcpu, VcpuState};
use crate::vm::{GuestFlags, Vm};

/// What a post-processing call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Nothing was complete; no state changed.
    Idle,
    /// The result was applied and the request consumed.
    Applied,
    /// The vCPU is being torn down; the result was dropped.
    Discarded,
}

/// Checks the request is `Complete` and of an accepted type. `Ok(false)` means it was already
/// consumed.
fn ready(vcpu: &Vcpu, accepts: &[RequestType]) -> Result<bool> {
    let req = vcpu.io_request();
    match req.state {
        RequestState::Free => return Ok(false),
        RequestState::Complete => {}
        found => {
            return Err(IoEmulError::UnexpectedState {
                vcpu_id: vcpu.id(),
                expected: RequestState::Complete,
                found,
            })
        }
    }
    let kind = req.access.request_type();
    if !accepts.contains(&kind) {
        tracing::warn!(vcpu_id = vcpu.id(), ?kind, "post-processing for wrong request type");
        return Err(IoEmulError::InvalidType(kind));
    }
    Ok(true)
}

/// Finishes a completed MMIO request: a read lands in the register named by
/// [`Vcpu::mmio_decode`]. A request that was already consumed is left alone.
pub fn emulate_mmio_post(vcpu: &mut Vcpu) -> Result<PostOutcome> {
    if !ready(vcpu, &[RequestType::Mmio])? {
        return Ok(PostOutcome::Idle);
    }

    let access = vcpu.io_request().access;
    if access.direction() == Direction::Read {
        match vcpu.mmio_decode {
            Some(decode) => decode.apply(&mut vcpu.regs, access.size(), access.value()),
            None => tracing::debug!(
                vcpu_id = vcpu.id(),
                addr = access.address(),
                "MMIO read without decoded destination"
            ),
        }
    }
    vcpu.mmio_decode = None;
    vcpu.io_request_mut().state = RequestState::Free;
    Ok(PostOutcome::Applied)
}

/// Finishes a completed port (or PCI config) request: a read lands in the low bytes of RAX.
pub fn emulate_pio_post(vcpu: &mut Vcpu) -> Result<PostOutcome> {
    if !ready(vcpu, &[RequestType::PortIo, RequestType::PciCfg])? {
        return Ok(PostOutcome::Idle);
    }

    let access = vcpu.io_request().access;
    if access.direction() == Direction::Read {
        vcpu.regs.merge(Gpr::Rax, access.size(), access.value());
    }
    vcpu.io_request_mut().state = RequestState::Free;
    Ok(PostOutcome::Applied)
}

/// Pulls the device model's answer into the vCPU and frees the shared slot. `Ok(false)` means
/// the slot was already released.
fn take_completed(vm: &Vm, vcpu: &mut Vcpu, accepts: &[RequestType]) -> Result<bool> {
    let channel = vm.channel();
    if channel.state(vcpu.id())? == RequestState::Free {
        return Ok(false);
    }
    let access: IoAccess = channel.completed(vcpu.id())?;
    let kind = access.request_type();
    if !accepts.contains(&kind) {
        tracing::warn!(
            vm_id = vm.id(),
            vcpu_id = vcpu.id(),
            ?kind,
            "completed request has wrong type"
        );
        return Err(IoEmulError::InvalidType(kind));
    }

    *vcpu.io_request_mut() = IoRequest {
        access,
        state: RequestState::Complete,
    };
    channel.release(vcpu.id())?;
    Ok(true)
}

pub fn dm_emulate_mmio_post(vm: &Vm, vcpu: &mut Vcpu) -> Result<PostOutcome> {
    if !take_completed(vm, vcpu, &[RequestType::Mmio])? {
        return Ok(PostOutcome::Idle);
    }
    emulate_mmio_post(vcpu)
}

pub fn dm_emulate_pio_post(vm: &Vm, vcpu: &mut Vcpu) -> Result<PostOutcome> {
    if !take_completed(vm, vcpu, &[RequestType::PortIo, RequestType::PciCfg])? {
        return Ok(PostOutcome::Idle);
    }
    emulate_pio_post(vcpu)
}

/// Applies the device model's completion, if there is one, and makes the vCPU runnable.
///
/// A vCPU being torn down only has its slot released.
pub fn emulate_io_post(vm: &Vm, vcpu: &mut Vcpu) -> Result<PostOutcome> {
    let channel = vm.channel();
    let vcpu_id = vcpu.id();
    if channel.state(vcpu_id)? != RequestState::Complete {
        return Ok(PostOutcome::Idle);
    }

    if vcpu.state() == VcpuState::Zombie {
        channel.release(vcpu_id)?;
        vcpu.io_request_mut().state = RequestState::Free;
        vcpu.mmio_decode = None;
        tracing::debug!(vm_id = vm.id(), vcpu_id, "completion discarded for zombie vCPU");
        return Ok(PostOutcome::Discarded);
    }

    let outcome = match channel.completed(vcpu_id)?.request_type() {
        RequestType::Mmio => dm_emulate_mmio_post(vm, vcpu)?,
        RequestType::PortIo | RequestType::PciCfg => dm_emulate_pio_post(vm, vcpu)?,
    };
    vcpu.resume();
    Ok(outcome)
}

/// Blocks the calling vCPU thread until the device model completes its request.
///
/// Waits at most [`crate::VmConfig::completion_timeout`]. On timeout the request stays in flight
/// and the vCPU stays paused.
pub fn wait_for_io_completion(vm: &Vm, vcpu: &Vcpu) -> Result<()> {
    let config = vm.config();
    let polling = config
        .guest_flags
        .contains(GuestFlags::IO_COMPLETION_POLLING);
    vm.channel()
        .wait_for_completion(vcpu.id(), config.completion_timeout(), polling)
}
