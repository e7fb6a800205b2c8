//! Guest E820 memory map for pre-launched VMs.
//!
//! Pre-launched VMs boot without firmware provided by a device model, so the hypervisor hands
//! them a fixed map: conventional RAM below the BIOS area, a reserved BIOS/MP-table window, RAM up
//! to the start of the 32-bit PCI hole, the reserved hole itself, and any remaining RAM above 4GiB.

use crate::{BoardError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
    AcpiReclaim = 3,
    AcpiNvs = 4,
    Unusable = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct E820Entry {
    pub base: u64,
    pub length: u64,
    #[serde(rename = "type")]
    pub kind: E820Type,
}

impl E820Entry {
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

const BIOS_AREA_BASE: u64 = 0xF_0000;
const LOW_RAM_BASE: u64 = 0x10_0000;
pub const PCI_HOLE_BASE: u64 = 0xE000_0000;
const FOUR_GIB: u64 = 0x1_0000_0000;

/// Builds the E820 table for a pre-launched VM with `mem_size` bytes of RAM.
pub fn create_prelaunched_vm_e820(mem_size: u64) -> Result<Vec<E820Entry>> {
    if mem_size <= LOW_RAM_BASE {
        return Err(BoardError::GuestMemoryTooSmall(mem_size));
    }

    let mut map = vec![
        E820Entry {
            base: 0,
            length: BIOS_AREA_BASE,
            kind: E820Type::Ram,
        },
        E820Entry {
            base: BIOS_AREA_BASE,
            length: LOW_RAM_BASE - BIOS_AREA_BASE,
            kind: E820Type::Reserved,
        },
    ];

    let low_end = mem_size.min(PCI_HOLE_BASE);
    map.push(E820Entry {
        base: LOW_RAM_BASE,
        length: low_end - LOW_RAM_BASE,
        kind: E820Type::Ram,
    });
    map.push(E820Entry {
        base: PCI_HOLE_BASE,
        length: FOUR_GIB - PCI_HOLE_BASE,
        kind: E820Type::Reserved,
    });

    if mem_size > PCI_HOLE_BASE {
        map.push(E820Entry {
            base: FOUR_GIB,
            length: mem_size - PCI_HOLE_BASE,
            kind: E820Type::Ram,
        });
    }

    Ok(map)
}
