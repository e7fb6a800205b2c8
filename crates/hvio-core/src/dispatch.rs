use crate::channel::CompletionToken;
use crate::error::{IoEmulError, Result, IOREQ_PENDING};
use crate::pio::Lookup;
use crate::request::{
    size_mask, Direction, IoAccess, MmioRequest, PioRequest, RequestState, RequestType,
};
use crate::vcpu::Vcpu;
use crate::vm::Vm;

/// How a submitted access was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResolution {
    /// Emulated in the hypervisor. For reads the value is already in the vCPU's request; run
    /// the matching post-processing next.
    Completed,
    /// Forwarded to the device model. The vCPU must not run until the slot completes.
    Deferred(CompletionToken),
}

impl IoResolution {
    /// Hypercall-style status: `0` or [`IOREQ_PENDING`].
    pub fn status(&self) -> i32 {
        match self {
            IoResolution::Completed => 0,
            IoResolution::Deferred(_) => IOREQ_PENDING,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, IoResolution::Deferred(_))
    }
}

/// Emulates the vCPU's current request.
///
/// Accesses fully inside a registered range run their handler synchronously. Accesses matching
/// nothing are handed to the device model, or float on the bus for VMs without one. On any
/// error the request stays `Free` and no state was changed.
pub fn emulate_io(vm: &Vm, vcpu: &mut Vcpu) -> Result<IoResolution> {
    let vcpu_id = vcpu.id();
    let req = *vcpu.io_request();
    if req.state != RequestState::Free {
        tracing::warn!(
            vm_id = vm.id(),
            vcpu_id,
            state = ?req.state,
            "I/O request already in flight"
        );
        return Err(IoEmulError::RequestInFlight {
            vcpu_id,
            state: req.state,
        });
    }

    let handled = match req.access {
        IoAccess::Pio(pio) => emulate_pio(vm, vcpu_id, pio)?.map(IoAccess::Pio),
        IoAccess::Mmio(mmio) => emulate_mmio(vm, vcpu_id, mmio)?.map(IoAccess::Mmio),
        IoAccess::PciCfg(_) => {
            tracing::warn!(vm_id = vm.id(), vcpu_id, "PCI config request cannot come from a trap");
            return Err(IoEmulError::InvalidType(req.access.request_type()));
        }
    };

    let request = vcpu.io_request_mut();
    if let Some(access) = handled {
        request.access = access;
        request.state = RequestState::Complete;
        return Ok(IoResolution::Completed);
    }

    if !vm.config().has_device_model() {
        // Nothing answers: reads float high, writes go nowhere.
        if request.access.direction() == Direction::Read {
            request.access.set_value(u64::MAX);
        }
        request.state = RequestState::Complete;
        tracing::debug!(
            vm_id = vm.id(),
            vcpu_id,
            addr = request.access.address(),
            size = request.access.size(),
            "unhandled access on VM without device model"
        );
        return Ok(IoResolution::Completed);
    }

    let token = vm
        .channel()
        .submit(vcpu_id, &request.access, vm.notifier())?;
    request.state = RequestState::Pending;
    tracing::debug!(
        vm_id = vm.id(),
        vcpu_id,
        kind = ?request.access.request_type(),
        addr = request.access.address(),
        size = request.access.size(),
        seq = token.seq,
        "I/O request forwarded to device model"
    );
    Ok(IoResolution::Deferred(token))
}

/// Runs the registered PIO handler, if any. `Ok(None)` means no handler claims the port.
fn emulate_pio(vm: &Vm, vcpu_id: u16, mut req: PioRequest) -> Result<Option<PioRequest>> {
    if !matches!(req.size, 1 | 2 | 4) {
        return Err(IoEmulError::InvalidArgument("port I/O size must be 1, 2 or 4"));
    }

    let registry = vm.pio_registry();
    let index = match registry.lookup(req.address, req.size) {
        Lookup::Hit(index) => index,
        Lookup::Miss => return Ok(None),
        Lookup::Spans => {
            tracing::error!(
                vm_id = vm.id(),
                vcpu_id,
                addr = req.address,
                size = req.size,
                "port access spans emulated ranges"
            );
            return Err(IoEmulError::SpansRanges {
                kind: RequestType::PortIo,
                address: u64::from(req.address),
                size: req.size,
            });
        }
    };
    let Some(handler) = registry.handler(index) else {
        return Ok(None);
    };

    let mask = size_mask(req.size) as u32;
    match req.direction {
        Direction::Read => req.value = (handler.read)(req.address, req.size)? & mask,
        Direction::Write => (handler.write)(req.address, req.size, req.value & mask)?,
    }
    tracing::debug!(
        vm_id = vm.id(),
        vcpu_id,
        ?index,
        addr = req.address,
        size = req.size,
        dir = ?req.direction,
        "port access emulated"
    );
    Ok(Some(req))
}

/// Runs the registered MMIO handler, if any. `Ok(None)` means no range claims the address.
fn emulate_mmio(vm: &Vm, vcpu_id: u16, mut req: MmioRequest) -> Result<Option<MmioRequest>> {
    if !matches!(req.size, 1 | 2 | 4 | 8) {
        return Err(IoEmulError::InvalidArgument("MMIO size must be 1, 2, 4 or 8"));
    }
    if req.address.checked_add(u64::from(req.size)).is_none() {
        return Err(IoEmulError::InvalidArgument("MMIO access wraps the address space"));
    }

    let registry = vm.mmio_registry();
    let idx = match registry.lookup(req.address, req.size) {
        Lookup::Hit(idx) => idx,
        Lookup::Miss => return Ok(None),
        Lookup::Spans => {
            tracing::error!(
                vm_id = vm.id(),
                vcpu_id,
                addr = req.address,
                size = req.size,
                "MMIO access spans emulated ranges"
            );
            return Err(IoEmulError::SpansRanges {
                kind: RequestType::Mmio,
                address: req.address,
                size: req.size,
            });
        }
    };

    if req.direction == Direction::Write {
        req.value &= size_mask(req.size);
    }
    registry.dispatch(idx, &mut req).map_err(|err| {
        tracing::warn!(vm_id = vm.id(), vcpu_id, addr = req.address, %err, "MMIO handler failed");
        err
    })?;
    req.value &= size_mask(req.size);
    tracing::debug!(
        vm_id = vm.id(),
        vcpu_id,
        addr = req.address,
        size = req.size,
        dir = ?req.direction,
        "MMIO access emulated"
    );
    Ok(Some(req))
}
