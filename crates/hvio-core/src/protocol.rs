//! Layout of a per-vCPU request slot shared with the device model.
//!
//! Each slot holds one fixed-size little-endian record. The slot's lifecycle state is kept
//! outside the record (see [`crate::channel`]) so it can be updated atomically.
//!
//! ```text
//! offset  size  field
//!      0     4  type       (0 = port I/O, 1 = MMIO, 2 = PCI config)
//!      4     4  direction  (0 = read, 1 = write)
//!      8     4  size       (bytes)
//!     12     4  aux        (PCI config: bus/device/function)
//!     16     8  address    (port, guest physical address, or config register)
//!     24     8  value
//! ```

use crate::request::{
    Direction, IoAccess, MmioRequest, PciCfgRequest, PioRequest, RequestType,
};
use thiserror::Error;

pub const SLOT_RECORD_BYTES: usize = 32;

mod offset {
    pub const TYPE: usize = 0;
    pub const DIRECTION: usize = 4;
    pub const SIZE: usize = 8;
    pub const AUX: usize = 12;
    pub const ADDRESS: usize = 16;
    pub const VALUE: usize = 24;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record too short: {0} bytes")]
    UnexpectedEof(usize),
    #[error("unknown request type {0}")]
    UnknownType(u32),
    #[error("unknown direction {0}")]
    UnknownDirection(u32),
    #[error("invalid access size {0}")]
    InvalidSize(u32),
    #[error("address {0:#x} out of range for request type")]
    AddressOutOfRange(u64),
}

pub fn encode_request(access: &IoAccess) -> [u8; SLOT_RECORD_BYTES] {
    let mut out = [0u8; SLOT_RECORD_BYTES];
    let (aux, address) = match access {
        IoAccess::PciCfg(r) => (u32::from(r.bdf), u64::from(r.reg)),
        other => (0, other.address()),
    };
    put_u32(&mut out, offset::TYPE, access.request_type() as u32);
    put_u32(&mut out, offset::DIRECTION, access.direction() as u32);
    put_u32(&mut out, offset::SIZE, u32::from(access.size()));
    put_u32(&mut out, offset::AUX, aux);
    put_u64(&mut out, offset::ADDRESS, address);
    put_u64(&mut out, offset::VALUE, access.value());
    out
}

pub fn decode_request(buf: &[u8]) -> Result<IoAccess, DecodeError> {
    if buf.len() < SLOT_RECORD_BYTES {
        return Err(DecodeError::UnexpectedEof(buf.len()));
    }

    let raw_type = get_u32(buf, offset::TYPE);
    let kind = RequestType::from_raw(raw_type).ok_or(DecodeError::UnknownType(raw_type))?;
    let raw_dir = get_u32(buf, offset::DIRECTION);
    let direction = Direction::from_raw(raw_dir).ok_or(DecodeError::UnknownDirection(raw_dir))?;
    let raw_size = get_u32(buf, offset::SIZE);
    let aux = get_u32(buf, offset::AUX);
    let address = get_u64(buf, offset::ADDRESS);
    let value = get_u64(buf, offset::VALUE);

    let valid_size = match kind {
        RequestType::PortIo | RequestType::PciCfg => matches!(raw_size, 1 | 2 | 4),
        RequestType::Mmio => matches!(raw_size, 1 | 2 | 4 | 8),
    };
    if !valid_size {
        return Err(DecodeError::InvalidSize(raw_size));
    }
    let size = raw_size as u8;

    Ok(match kind {
        RequestType::PortIo => IoAccess::Pio(PioRequest {
            address: u16::try_from(address).map_err(|_| DecodeError::AddressOutOfRange(address))?,
            size,
            direction,
            value: value as u32,
        }),
        RequestType::Mmio => IoAccess::Mmio(MmioRequest {
            address,
            size,
            direction,
            value,
        }),
        RequestType::PciCfg => IoAccess::PciCfg(PciCfgRequest {
            bdf: aux as u16,
            reg: u32::try_from(address).map_err(|_| DecodeError::AddressOutOfRange(address))?,
            size,
            direction,
            value: value as u32,
        }),
    })
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}
