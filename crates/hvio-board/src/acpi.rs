//! ACPI register descriptions shared by the power-state tables.

use serde::{Deserialize, Serialize};

/// ACPI Generic Address Structure (GAS).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcpiGenericAddress {
    pub space_id: u8,
    pub bit_width: u8,
    pub bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

impl AcpiGenericAddress {
    pub const SPACE_SYSTEM_MEMORY: u8 = 0;
    pub const SPACE_SYSTEM_IO: u8 = 1;
    pub const SPACE_FFIXED_HW: u8 = 0x7F;

    pub const fn system_io(address: u16, bit_width: u8) -> Self {
        Self {
            space_id: Self::SPACE_SYSTEM_IO,
            bit_width,
            bit_offset: 0,
            access_size: 0,
            address: address as u64,
        }
    }

    /// An all-zero GAS is how board tables spell "not present" (e.g. a missing PM1B block).
    pub fn is_present(&self) -> bool {
        self.address != 0
    }

    pub fn is_system_io(&self) -> bool {
        self.space_id == Self::SPACE_SYSTEM_IO
    }

    /// Register width in bytes, rounded up.
    pub fn byte_width(&self) -> u32 {
        u32::from(self.bit_width).div_ceil(8)
    }
}

/// `SLP_TYP` values written to PM1A/PM1B control to enter a sleep state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SxData {
    pub val_pm1a: u8,
    pub val_pm1b: u8,
    pub reserved: u16,
}

/// Host ACPI fixed-feature sleep-state registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcpiSstateInfo {
    pub pm1a_evt: AcpiGenericAddress,
    pub pm1b_evt: AcpiGenericAddress,
    pub pm1a_cnt: AcpiGenericAddress,
    pub pm1b_cnt: AcpiGenericAddress,
    pub s3_pkg: SxData,
    pub s5_pkg: SxData,
    pub wake_vector_32: u64,
    pub wake_vector_64: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_width_rounds_up() {
        assert_eq!(AcpiGenericAddress::system_io(0x400, 32).byte_width(), 4);
        assert_eq!(AcpiGenericAddress::system_io(0x404, 16).byte_width(), 2);
        assert_eq!(AcpiGenericAddress::system_io(0x404, 12).byte_width(), 2);
        assert_eq!(AcpiGenericAddress::default().byte_width(), 0);
    }

    #[test]
    fn zero_address_means_absent() {
        assert!(!AcpiGenericAddress::default().is_present());
        assert!(AcpiGenericAddress::system_io(0x1800, 32).is_present());
    }
}
