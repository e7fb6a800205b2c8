//! Cache-QoS (CAT) class-of-service descriptors.

use crate::{BoardError, Result};
use serde::{Deserialize, Serialize};

pub const MAX_PLATFORM_CLOS_NUM: usize = 16;

/// `IA32_L3_QOS_MASK_0`.
pub const MSR_IA32_L3_MASK_BASE: u32 = 0x0C90;
/// `IA32_L2_QOS_MASK_0`.
pub const MSR_IA32_L2_MASK_BASE: u32 = 0x0D10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformClosInfo {
    pub clos_mask: u32,
    pub msr_index: u32,
}

impl PlatformClosInfo {
    pub fn l2(clos_id: u32, clos_mask: u32) -> Self {
        Self {
            clos_mask,
            msr_index: MSR_IA32_L2_MASK_BASE + clos_id,
        }
    }

    pub fn l3(clos_id: u32, clos_mask: u32) -> Self {
        Self {
            clos_mask,
            msr_index: MSR_IA32_L3_MASK_BASE + clos_id,
        }
    }
}

/// CAT requires capacity bitmasks to be a single non-empty run of set bits.
fn is_contiguous(mask: u32) -> bool {
    if mask == 0 {
        return false;
    }
    let shifted = mask >> mask.trailing_zeros();
    shifted & shifted.wrapping_add(1) == 0
}

pub(crate) fn validate(entries: &[PlatformClosInfo]) -> Result<()> {
    if entries.len() > MAX_PLATFORM_CLOS_NUM {
        return Err(BoardError::TooManyClos {
            count: entries.len(),
            max: MAX_PLATFORM_CLOS_NUM,
        });
    }
    for (index, entry) in entries.iter().enumerate() {
        if !is_contiguous(entry.clos_mask) {
            return Err(BoardError::NonContiguousClosMask {
                index,
                mask: entry.clos_mask,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_masks() {
        assert!(is_contiguous(0xff));
        assert!(is_contiguous(0xf0));
        assert!(is_contiguous(0x8000_0000));
        assert!(is_contiguous(u32::MAX));
        assert!(!is_contiguous(0));
        assert!(!is_contiguous(0b1011));
    }

    #[test]
    fn msr_indices_follow_clos_id() {
        assert_eq!(PlatformClosInfo::l2(0, 0xff).msr_index, 0x0D10);
        assert_eq!(PlatformClosInfo::l2(3, 0xff).msr_index, 0x0D13);
        assert_eq!(PlatformClosInfo::l3(1, 0xf).msr_index, 0x0C91);
    }

    #[test]
    fn validate_rejects_sparse_mask_and_overflow() {
        let bad = [PlatformClosInfo::l2(0, 0xff), PlatformClosInfo::l2(1, 0x101)];
        assert!(matches!(
            validate(&bad),
            Err(BoardError::NonContiguousClosMask { index: 1, mask: 0x101 })
        ));

        let many = vec![PlatformClosInfo::l2(0, 0xff); MAX_PLATFORM_CLOS_NUM + 1];
        assert!(matches!(
            validate(&many),
            Err(BoardError::TooManyClos { count: 17, max: 16 })
        ));

        assert!(validate(&many[..MAX_PLATFORM_CLOS_NUM]).is_ok());
    }
}
