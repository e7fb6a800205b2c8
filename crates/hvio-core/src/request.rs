//! The in-flight representation of one guest I/O access.

/// Wire code of a request type, as stored in the shared request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestType {
    PortIo = 0,
    Mmio = 1,
    PciCfg = 2,
}

impl RequestType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(RequestType::PortIo),
            1 => Some(RequestType::Mmio),
            2 => Some(RequestType::PciCfg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

impl Direction {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Direction::Read),
            1 => Some(Direction::Write),
            _ => None,
        }
    }
}

/// Lifecycle of a request: `Free -> Pending -> Processing -> Complete -> Free`.
///
/// Requests resolved by an in-hypervisor handler skip straight from `Free` to `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum RequestState {
    #[default]
    Free = 0,
    /// Submitted to the device model, not yet picked up.
    Pending = 1,
    /// Claimed by the device model.
    Processing = 2,
    /// Result is available; waiting for post-processing.
    Complete = 3,
}

impl RequestState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(RequestState::Free),
            1 => Some(RequestState::Pending),
            2 => Some(RequestState::Processing),
            3 => Some(RequestState::Complete),
            _ => None,
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, RequestState::Pending | RequestState::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRequest {
    pub address: u16,
    pub size: u8,
    pub direction: Direction,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRequest {
    pub address: u64,
    pub size: u8,
    pub direction: Direction,
    pub value: u64,
}

/// PCI configuration access, produced when the device model folds a CF8/CFC port pair into a
/// single config-space request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciCfgRequest {
    /// Bus/device/function packed as `bus << 8 | dev << 3 | func`.
    pub bdf: u16,
    pub reg: u32,
    pub size: u8,
    pub direction: Direction,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAccess {
    Pio(PioRequest),
    Mmio(MmioRequest),
    PciCfg(PciCfgRequest),
}

impl IoAccess {
    pub fn pio_read(address: u16, size: u8) -> Self {
        IoAccess::Pio(PioRequest {
            address,
            size,
            direction: Direction::Read,
            value: 0,
        })
    }

    pub fn pio_write(address: u16, size: u8, value: u32) -> Self {
        IoAccess::Pio(PioRequest {
            address,
            size,
            direction: Direction::Write,
            value,
        })
    }

    pub fn mmio_read(address: u64, size: u8) -> Self {
        IoAccess::Mmio(MmioRequest {
            address,
            size,
            direction: Direction::Read,
            value: 0,
        })
    }

    pub fn mmio_write(address: u64, size: u8, value: u64) -> Self {
        IoAccess::Mmio(MmioRequest {
            address,
            size,
            direction: Direction::Write,
            value,
        })
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            IoAccess::Pio(_) => RequestType::PortIo,
            IoAccess::Mmio(_) => RequestType::Mmio,
            IoAccess::PciCfg(_) => RequestType::PciCfg,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            IoAccess::Pio(r) => r.direction,
            IoAccess::Mmio(r) => r.direction,
            IoAccess::PciCfg(r) => r.direction,
        }
    }

    pub fn size(&self) -> u8 {
        match self {
            IoAccess::Pio(r) => r.size,
            IoAccess::Mmio(r) => r.size,
            IoAccess::PciCfg(r) => r.size,
        }
    }

    pub fn address(&self) -> u64 {
        match self {
            IoAccess::Pio(r) => u64::from(r.address),
            IoAccess::Mmio(r) => r.address,
            IoAccess::PciCfg(r) => u64::from(r.reg),
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            IoAccess::Pio(r) => u64::from(r.value),
            IoAccess::Mmio(r) => r.value,
            IoAccess::PciCfg(r) => u64::from(r.value),
        }
    }

    /// Stores a completion value, truncated to the access size.
    pub fn set_value(&mut self, value: u64) {
        match self {
            IoAccess::Pio(r) => r.value = (value & size_mask(r.size)) as u32,
            IoAccess::Mmio(r) => r.value = value & size_mask(r.size),
            IoAccess::PciCfg(r) => r.value = (value & size_mask(r.size)) as u32,
        }
    }
}

/// The vCPU's request object: what is being accessed plus where it is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub access: IoAccess,
    pub state: RequestState,
}

impl IoRequest {
    pub fn new(access: IoAccess) -> Self {
        Self {
            access,
            state: RequestState::Free,
        }
    }
}

impl Default for IoRequest {
    fn default() -> Self {
        Self::new(IoAccess::pio_read(0, 1))
    }
}

/// Mask covering the low `size` bytes.
pub fn size_mask(size: u8) -> u64 {
    match size {
        0 => 0,
        s if s >= 8 => u64::MAX,
        s => (1u64 << (u32::from(s) * 8)) - 1,
    }
}
