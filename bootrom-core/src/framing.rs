//! Address & Length Framing: the two small wire grammars shared by several
//! commands. Region validation and the virtual-address offset are handled
//! by the caller (see `session::Session::read_address_frame`) since they
//! depend on configuration this module doesn't need to know about.

use crate::link::{ByteLink, FRAME_BYTE_TIMEOUT};

/// Read `b0 b1 b2 b3 x` and return the big-endian address `b0..b3` iff
/// `b0 ^ b1 ^ b2 ^ b3 ^ x == 0`.
pub fn read_address<L: ByteLink>(link: &mut L) -> Option<u32> {
    let mut xor = 0u8;
    let mut addr = 0u32;

    for _ in 0..4 {
        let b = link.wait_byte(FRAME_BYTE_TIMEOUT)?;
        xor ^= b;
        addr = (addr << 8) | u32::from(b);
    }

    let x = link.wait_byte(FRAME_BYTE_TIMEOUT)?;
    xor ^= x;

    if xor != 0 {
        return None;
    }

    Some(addr)
}

/// Read `n, m` and return `u16::from(n) + 1` (range `1..=256`) iff
/// `n ^ m == 0xFF`.
pub fn read_length<L: ByteLink>(link: &mut L) -> Option<u16> {
    let n = link.wait_byte(FRAME_BYTE_TIMEOUT)?;
    let m = link.wait_byte(FRAME_BYTE_TIMEOUT)?;

    if n ^ m != 0xFF {
        return None;
    }

    Some(u16::from(n) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_support::MockLink;

    #[test]
    fn valid_address_frame_parses() {
        let mut link = MockLink::with_rx(&[0x08, 0x00, 0x80, 0x00, 0x88]);
        assert_eq!(read_address(&mut link), Some(0x0800_8000));
    }

    #[test]
    fn bad_address_checksum_is_rejected() {
        let mut link = MockLink::with_rx(&[0x08, 0x00, 0x80, 0x00, 0x00]);
        assert_eq!(read_address(&mut link), None);
    }

    #[test]
    fn truncated_address_frame_times_out() {
        let mut link = MockLink::with_rx(&[0x08, 0x00]);
        assert_eq!(read_address(&mut link), None);
    }

    #[test]
    fn canonical_mass_erase_length_decodes_to_256() {
        let mut link = MockLink::with_rx(&[0xFF, 0x00]);
        assert_eq!(read_length(&mut link), Some(256));
    }

    #[test]
    fn bad_length_complement_is_rejected() {
        let mut link = MockLink::with_rx(&[0x03, 0x03]);
        assert_eq!(read_length(&mut link), None);
    }
}
