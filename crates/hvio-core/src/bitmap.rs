//! Per-VM port-I/O pass-through authorization.

const PORT_COUNT: usize = 0x1_0000;
const WORDS: usize = PORT_COUNT / 64;

/// One bit per I/O port; a set bit means the guest may access the port directly.
#[derive(Clone)]
pub struct IoBitmap {
    words: Box<[u64]>,
}

impl IoBitmap {
    /// Every port intercepted.
    pub fn intercept_all() -> Self {
        Self {
            words: vec![0; WORDS].into_boxed_slice(),
        }
    }

    /// Every port passed through.
    pub fn passthrough_all() -> Self {
        Self {
            words: vec![u64::MAX; WORDS].into_boxed_slice(),
        }
    }

    /// Ports `[port, port + nbytes)`, clamped at the top of the 16-bit port space.
    fn ports(port: u16, nbytes: u32) -> impl Iterator<Item = usize> {
        let start = usize::from(port);
        let end = (start + nbytes as usize).min(PORT_COUNT);
        start..end
    }

    pub fn allow(&mut self, port: u16, nbytes: u32) {
        for p in Self::ports(port, nbytes) {
            self.words[p / 64] |= 1 << (p % 64);
        }
    }

    pub fn deny(&mut self, port: u16, nbytes: u32) {
        for p in Self::ports(port, nbytes) {
            self.words[p / 64] &= !(1 << (p % 64));
        }
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        let p = usize::from(port);
        self.words[p / 64] & (1 << (p % 64)) != 0
    }

    /// True only if every byte of a `size`-byte access at `port` is passed through. An access
    /// running past port 0xFFFF is never passed through.
    pub fn covers(&self, port: u16, size: u8) -> bool {
        let start = usize::from(port);
        let end = start + usize::from(size);
        if size == 0 || end > PORT_COUNT {
            return false;
        }
        (start..end).all(|p| self.words[p / 64] & (1 << (p % 64)) != 0)
    }
}

impl std::fmt::Debug for IoBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let allowed: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        f.debug_struct("IoBitmap")
            .field("allowed_ports", &allowed)
            .finish()
    }
}
