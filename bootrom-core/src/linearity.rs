//! Linearity Tracker: binds reads/writes in a session to a single
//! contiguous sweep starting at the application base, so the keystream
//! stays in lock-step with the host.

use crate::config::BootCfg;
use crate::keystream::Keystream;

pub struct LinearityTracker {
    next_expected_addr: u32,
}

impl LinearityTracker {
    pub const fn new() -> Self {
        LinearityTracker {
            next_expected_addr: 0,
        }
    }

    /// Check and (on success) advance the tracker for an access of `count`
    /// bytes starting at `addr`. Addresses outside the flash range bypass
    /// the check and are always accepted.
    ///
    /// Unlike the reference implementation, `next_expected_addr` is left
    /// untouched when the check fails, so a rejected frame can never mask a
    /// later linearity violation.
    pub fn check(
        &mut self,
        cfg: &BootCfg,
        keystream: &mut impl Keystream,
        addr: u32,
        count: u32,
    ) -> bool {
        if (addr >> 24) != (cfg.flash_base >> 24) {
            return true;
        }

        let starts_sweep = addr == cfg.bootloader_to;
        let accepted = starts_sweep || addr == self.next_expected_addr;

        if accepted {
            if starts_sweep {
                keystream.reseed();
            }
            self.next_expected_addr = addr.wrapping_add(count);
        }

        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::STM32F100_LD;
    use crate::keystream::Xorshift32;

    #[test]
    fn sweep_must_start_at_bootloader_to() {
        let mut t = LinearityTracker::new();
        let mut k = Xorshift32::new(1);
        assert!(!t.check(&STM32F100_LD, &mut k, STM32F100_LD.bootloader_to + 4, 4));
        assert!(t.check(&STM32F100_LD, &mut k, STM32F100_LD.bootloader_to, 4));
    }

    #[test]
    fn contiguous_follow_up_is_accepted_and_gaps_are_rejected() {
        let mut t = LinearityTracker::new();
        let mut k = Xorshift32::new(1);
        assert!(t.check(&STM32F100_LD, &mut k, STM32F100_LD.bootloader_to, 4));
        assert!(t.check(&STM32F100_LD, &mut k, STM32F100_LD.bootloader_to + 4, 4));
        // A gap is rejected, and does not silently resync.
        assert!(!t.check(&STM32F100_LD, &mut k, STM32F100_LD.bootloader_to + 16, 4));
        assert!(!t.check(&STM32F100_LD, &mut k, STM32F100_LD.bootloader_to + 8, 4));
    }

    #[test]
    fn non_flash_addresses_bypass_the_tracker() {
        let mut t = LinearityTracker::new();
        let mut k = Xorshift32::new(1);
        assert!(t.check(&STM32F100_LD, &mut k, 0x1FFF_F7E0, 2));
        assert!(t.check(&STM32F100_LD, &mut k, 0x1FFF_F7E0, 2));
    }
}
