//! DMA remapping (VT-d) hardware unit descriptions taken from the ACPI DMAR table.

use crate::{BoardError, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DrhdFlags: u8 {
        /// The unit covers every PCI device on its segment not claimed by another unit.
        const INCLUDE_PCI_ALL = 1 << 0;
    }
}

/// DMAR device scope entry type.
pub const SCOPE_PCI_ENDPOINT: u8 = 1;
pub const SCOPE_PCI_SUB_HIERARCHY: u8 = 2;
pub const SCOPE_IOAPIC: u8 = 3;
pub const SCOPE_HPET: u8 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmarDevScope {
    #[serde(rename = "type")]
    pub scope_type: u8,
    pub id: u8,
    pub bus: u8,
    pub devfun: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmarDrhd {
    pub segment: u16,
    pub flags: DrhdFlags,
    /// Unit is present in the table but not used by the hypervisor (e.g. the GPU unit).
    pub ignore: bool,
    pub reg_base_addr: u64,
    pub devices: Vec<DmarDevScope>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmarInfo {
    pub drhd_units: Vec<DmarDrhd>,
}

impl DmarInfo {
    /// Finds the remapping unit responsible for the PCI function `bus:devfun` on `segment`.
    ///
    /// An explicit device scope match wins over a catch-all `INCLUDE_PCI_ALL` unit. Ignored
    /// units never match.
    pub fn drhd_for_device(&self, segment: u16, bus: u8, devfun: u8) -> Option<&DmarDrhd> {
        let active = || {
            self.drhd_units
                .iter()
                .filter(move |u| !u.ignore && u.segment == segment)
        };

        active()
            .find(|u| {
                u.devices.iter().any(|d| {
                    matches!(d.scope_type, SCOPE_PCI_ENDPOINT | SCOPE_PCI_SUB_HIERARCHY)
                        && d.bus == bus
                        && d.devfun == devfun
                })
            })
            .or_else(|| active().find(|u| u.flags.contains(DrhdFlags::INCLUDE_PCI_ALL)))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for unit in &self.drhd_units {
            if unit.reg_base_addr == 0 && !unit.ignore {
                return Err(BoardError::InvalidDmar("active DRHD without register base"));
            }
            if unit.reg_base_addr & 0xFFF != 0 {
                return Err(BoardError::InvalidDmar("DRHD register base not page aligned"));
            }
        }

        let mut catch_all_segments: Vec<u16> = self
            .drhd_units
            .iter()
            .filter(|u| !u.ignore && u.flags.contains(DrhdFlags::INCLUDE_PCI_ALL))
            .map(|u| u.segment)
            .collect();
        let before = catch_all_segments.len();
        catch_all_segments.sort_unstable();
        catch_all_segments.dedup();
        if catch_all_segments.len() != before {
            return Err(BoardError::InvalidDmar(
                "more than one INCLUDE_PCI_ALL unit on a segment",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_dmar() -> DmarInfo {
        DmarInfo {
            drhd_units: vec![
                DmarDrhd {
                    segment: 0,
                    flags: DrhdFlags::empty(),
                    ignore: false,
                    reg_base_addr: 0xFED6_4000,
                    devices: vec![DmarDevScope {
                        scope_type: SCOPE_PCI_ENDPOINT,
                        id: 0,
                        bus: 0,
                        devfun: 0x10,
                    }],
                },
                DmarDrhd {
                    segment: 0,
                    flags: DrhdFlags::INCLUDE_PCI_ALL,
                    ignore: false,
                    reg_base_addr: 0xFED6_5000,
                    devices: vec![DmarDevScope {
                        scope_type: SCOPE_IOAPIC,
                        id: 1,
                        bus: 0xFA,
                        devfun: 0xF8,
                    }],
                },
            ],
        }
    }

    #[test]
    fn explicit_scope_wins_over_catch_all() {
        let dmar = board_dmar();
        assert_eq!(
            dmar.drhd_for_device(0, 0, 0x10).map(|u| u.reg_base_addr),
            Some(0xFED6_4000)
        );
        assert_eq!(
            dmar.drhd_for_device(0, 3, 0x00).map(|u| u.reg_base_addr),
            Some(0xFED6_5000)
        );
        assert!(dmar.drhd_for_device(1, 0, 0x10).is_none());
    }

    #[test]
    fn ignored_unit_does_not_match() {
        let mut dmar = board_dmar();
        dmar.drhd_units[0].ignore = true;
        assert_eq!(
            dmar.drhd_for_device(0, 0, 0x10).map(|u| u.reg_base_addr),
            Some(0xFED6_5000)
        );
    }

    #[test]
    fn duplicate_catch_all_is_invalid() {
        let mut dmar = board_dmar();
        dmar.drhd_units[0].flags = DrhdFlags::INCLUDE_PCI_ALL;
        assert!(matches!(dmar.validate(), Err(BoardError::InvalidDmar(_))));
        assert!(board_dmar().validate().is_ok());
    }
}
