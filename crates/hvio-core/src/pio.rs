//! Fixed-index registry of in-hypervisor port-I/O handlers.
//!
//! The legacy devices a hypervisor emulates itself live at well-known ports, so handlers are
//! bound to a small closed set of indices rather than to arbitrary port numbers.

use crate::error::{HandlerError, IoEmulError, Result};
use hvio_board::AcpiGenericAddress;
use std::fmt;

pub const PIC_MASTER_PORT: u16 = 0x20;
pub const PIC_SLAVE_PORT: u16 = 0xA0;
pub const PIC_ELC_PORT: u16 = 0x4D0;
pub const PCI_CONFIG_ADDR_PORT: u16 = 0xCF8;
pub const PCI_CONFIG_DATA_PORT: u16 = 0xCFC;
pub const UART_COM1_PORT: u16 = 0x3F8;
pub const RTC_PORT: u16 = 0x70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PioIndex {
    PicMaster = 0,
    PicSlave,
    PicElc,
    PciCfgAddr,
    PciCfgData,
    Uart,
    Pm1aEvt,
    Pm1aCnt,
    Pm1bEvt,
    Pm1bCnt,
    Rtc,
}

pub const EMUL_PIO_IDX_MAX: usize = PioIndex::Rtc as usize + 1;

impl PioIndex {
    pub const ALL: [PioIndex; EMUL_PIO_IDX_MAX] = [
        PioIndex::PicMaster,
        PioIndex::PicSlave,
        PioIndex::PicElc,
        PioIndex::PciCfgAddr,
        PioIndex::PciCfgData,
        PioIndex::Uart,
        PioIndex::Pm1aEvt,
        PioIndex::Pm1aCnt,
        PioIndex::Pm1bEvt,
        PioIndex::Pm1bCnt,
        PioIndex::Rtc,
    ];

    /// Conventional PC port range for the device, where one exists. PM1 blocks are
    /// board-specific and come from the ACPI sleep-state table instead.
    pub fn default_range(self) -> Option<PioRange> {
        let (base, len) = match self {
            PioIndex::PicMaster => (PIC_MASTER_PORT, 2),
            PioIndex::PicSlave => (PIC_SLAVE_PORT, 2),
            PioIndex::PicElc => (PIC_ELC_PORT, 2),
            PioIndex::PciCfgAddr => (PCI_CONFIG_ADDR_PORT, 4),
            PioIndex::PciCfgData => (PCI_CONFIG_DATA_PORT, 4),
            PioIndex::Uart => (UART_COM1_PORT, 8),
            PioIndex::Rtc => (RTC_PORT, 2),
            PioIndex::Pm1aEvt | PioIndex::Pm1aCnt | PioIndex::Pm1bEvt | PioIndex::Pm1bCnt => {
                return None
            }
        };
        Some(PioRange { base, len })
    }
}

/// Contiguous port range `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRange {
    pub base: u16,
    pub len: u16,
}

impl PioRange {
    pub const fn new(base: u16, len: u16) -> Self {
        Self { base, len }
    }

    pub fn end_exclusive(&self) -> u32 {
        u32::from(self.base) + u32::from(self.len)
    }

    pub fn overlaps(&self, other: &PioRange) -> bool {
        u32::from(self.base) < other.end_exclusive() && u32::from(other.base) < self.end_exclusive()
    }
}

impl TryFrom<&AcpiGenericAddress> for PioRange {
    type Error = IoEmulError;

    fn try_from(gas: &AcpiGenericAddress) -> Result<Self> {
        if !gas.is_system_io() || !gas.is_present() {
            return Err(IoEmulError::InvalidArgument(
                "register block is not in system I/O space",
            ));
        }
        let base = u16::try_from(gas.address)
            .map_err(|_| IoEmulError::InvalidArgument("register block beyond port 0xFFFF"))?;
        let len = u16::try_from(gas.byte_width())
            .ok()
            .filter(|&len| len != 0)
            .ok_or(IoEmulError::InvalidArgument("register block has no width"))?;
        Ok(PioRange { base, len })
    }
}

pub type PioReadFn = Box<dyn Fn(u16, u8) -> std::result::Result<u32, HandlerError> + Send + Sync>;
pub type PioWriteFn =
    Box<dyn Fn(u16, u8, u32) -> std::result::Result<(), HandlerError> + Send + Sync>;

pub(crate) struct PioHandler {
    pub(crate) range: PioRange,
    pub(crate) read: PioReadFn,
    pub(crate) write: PioWriteFn,
}

/// Result of looking up an access in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup<K> {
    Hit(K),
    /// The access intersects a registered range without being contained in it.
    Spans,
    Miss,
}

#[derive(Default)]
pub struct PioRegistry {
    handlers: [Option<PioHandler>; EMUL_PIO_IDX_MAX],
}

impl PioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        index: PioIndex,
        range: PioRange,
        read: PioReadFn,
        write: PioWriteFn,
    ) -> Result<()> {
        if range.len == 0 {
            return Err(IoEmulError::InvalidArgument("empty port range"));
        }
        if range.end_exclusive() > 0x1_0000 {
            return Err(IoEmulError::InvalidArgument("port range wraps past 0xFFFF"));
        }
        let clash = PioIndex::ALL.iter().find(|&&other| {
            other != index
                && self.handlers[other as usize]
                    .as_ref()
                    .is_some_and(|h| h.range.overlaps(&range))
        });
        if let Some(other) = clash {
            tracing::warn!(?index, ?other, ?range, "overlapping port range rejected");
            return Err(IoEmulError::InvalidArgument(
                "port range overlaps another emulated device",
            ));
        }

        self.handlers[index as usize] = Some(PioHandler { range, read, write });
        Ok(())
    }

    pub fn range(&self, index: PioIndex) -> Option<PioRange> {
        self.handlers[index as usize].as_ref().map(|h| h.range)
    }

    pub(crate) fn lookup(&self, port: u16, size: u8) -> Lookup<PioIndex> {
        let start = u32::from(port);
        let end = start + u32::from(size);
        for index in PioIndex::ALL {
            let Some(h) = &self.handlers[index as usize] else {
                continue;
            };
            let base = u32::from(h.range.base);
            let limit = h.range.end_exclusive();
            if end <= base || start >= limit {
                continue;
            }
            if start >= base && end <= limit {
                return Lookup::Hit(index);
            }
            return Lookup::Spans;
        }
        Lookup::Miss
    }

    pub(crate) fn handler(&self, index: PioIndex) -> Option<&PioHandler> {
        self.handlers[index as usize].as_ref()
    }
}

impl fmt::Debug for PioRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                PioIndex::ALL
                    .iter()
                    .filter_map(|&i| self.range(i).map(|r| (i, r))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_read() -> PioReadFn {
        Box::new(|_, _| Ok(0))
    }

    fn noop_write() -> PioWriteFn {
        Box::new(|_, _, _| Ok(()))
    }

    #[test]
    fn index_space_is_closed() {
        assert_eq!(EMUL_PIO_IDX_MAX, 11);
        for (i, index) in PioIndex::ALL.iter().enumerate() {
            assert_eq!(*index as usize, i);
        }
    }

    #[test]
    fn lookup_classifies_contained_spanning_and_missing_accesses() {
        let mut reg = PioRegistry::new();
        reg.register(
            PioIndex::Uart,
            PioRange::new(UART_COM1_PORT, 8),
            noop_read(),
            noop_write(),
        )
        .unwrap();

        assert_eq!(reg.lookup(0x3F8, 1), Lookup::Hit(PioIndex::Uart));
        assert_eq!(reg.lookup(0x3FC, 4), Lookup::Hit(PioIndex::Uart));
        assert_eq!(reg.lookup(0x3FE, 4), Lookup::Spans);
        assert_eq!(reg.lookup(0x3F6, 4), Lookup::Spans);
        assert_eq!(reg.lookup(0x3F4, 4), Lookup::Miss);
        assert_eq!(reg.lookup(0x400, 1), Lookup::Miss);
    }

    #[test]
    fn reregistering_an_index_replaces_it() {
        let mut reg = PioRegistry::new();
        reg.register(PioIndex::Rtc, PioRange::new(0x70, 2), noop_read(), noop_write())
            .unwrap();
        reg.register(PioIndex::Rtc, PioRange::new(0x72, 2), noop_read(), noop_write())
            .unwrap();
        assert_eq!(reg.range(PioIndex::Rtc), Some(PioRange::new(0x72, 2)));
        assert_eq!(reg.lookup(0x70, 1), Lookup::Miss);
    }

    #[test]
    fn overlapping_indices_and_bad_ranges_are_rejected() {
        let mut reg = PioRegistry::new();
        reg.register(PioIndex::PciCfgAddr, PioRange::new(0xCF8, 4), noop_read(), noop_write())
            .unwrap();
        assert!(reg
            .register(PioIndex::PciCfgData, PioRange::new(0xCFA, 4), noop_read(), noop_write())
            .is_err());
        assert!(reg
            .register(PioIndex::Uart, PioRange::new(0x3F8, 0), noop_read(), noop_write())
            .is_err());
        assert!(reg
            .register(PioIndex::Uart, PioRange::new(0xFFFC, 8), noop_read(), noop_write())
            .is_err());
        assert_eq!(reg.range(PioIndex::PciCfgData), None);
    }

    #[test]
    fn range_from_generic_address() {
        let gas = AcpiGenericAddress::system_io(0x400, 32);
        assert_eq!(PioRange::try_from(&gas).unwrap(), PioRange::new(0x400, 4));

        let mmio = AcpiGenericAddress {
            space_id: AcpiGenericAddress::SPACE_SYSTEM_MEMORY,
            bit_width: 32,
            address: 0xFED0_0000,
            ..Default::default()
        };
        assert!(PioRange::try_from(&mmio).is_err());
        assert!(PioRange::try_from(&AcpiGenericAddress::default()).is_err());
    }

    #[test]
    fn default_ranges_do_not_overlap() {
        let ranges: Vec<_> = PioIndex::ALL
            .iter()
            .filter_map(|i| i.default_range())
            .collect();
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} vs {b:?}");
            }
        }
    }
}
