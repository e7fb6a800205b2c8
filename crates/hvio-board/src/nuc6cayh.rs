//! Intel NUC6CAYH (Apollo Lake).
//!
//! This board ships without pre-generated DMAR, CLOS or CPU power-state tables; they are left
//! empty and expected to be filled in from a generated board description
//! ([`crate::BoardInfo::from_json`]) or by runtime ACPI parsing.

use crate::acpi::{AcpiGenericAddress, AcpiSstateInfo, SxData};
use crate::BoardInfo;

pub const BOARD_NAME: &str = "nuc6cayh";

pub const PM1A_EVT_PORT: u16 = 0x0400;
pub const PM1A_CNT_PORT: u16 = 0x0404;

pub fn board_info() -> BoardInfo {
    BoardInfo {
        name: BOARD_NAME.to_string(),
        sstate: AcpiSstateInfo {
            pm1a_evt: AcpiGenericAddress::system_io(PM1A_EVT_PORT, 32),
            pm1b_evt: AcpiGenericAddress::default(),
            pm1a_cnt: AcpiGenericAddress::system_io(PM1A_CNT_PORT, 16),
            pm1b_cnt: AcpiGenericAddress::default(),
            s3_pkg: SxData {
                val_pm1a: 0x05,
                val_pm1b: 0,
                reserved: 0,
            },
            s5_pkg: SxData {
                val_pm1a: 0x07,
                val_pm1b: 0,
                reserved: 0,
            },
            wake_vector_32: 0x7AEF_F00C,
            wake_vector_64: 0x7AEF_F018,
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_empty_but_valid() {
        let info = board_info();
        assert!(info.dmar.drhd_units.is_empty());
        assert!(info.clos.is_empty());
        assert!(info.cpu_state.is_empty());
        assert!(info.validate().is_ok());
        assert!(info.sstate.pm1a_evt.is_system_io());
        assert!(!info.sstate.pm1b_cnt.is_present());
    }
}
