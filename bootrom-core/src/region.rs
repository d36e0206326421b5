//! Region Policy: which addresses a session is allowed to touch.

use crate::config::BootCfg;

/// True iff `addr` may be read or written.
///
/// An address is permitted iff it is outside the reserved bootloader range
/// and either lies in the flash array or in the 64 KiB window containing
/// the chip's flash-size identification half-word.
pub fn check_addr(cfg: &BootCfg, addr: u32) -> bool {
    if addr >= cfg.bootloader_from && addr < cfg.bootloader_to {
        return false;
    }

    if (addr >> 16) == (cfg.flash_size_id_addr >> 16) {
        return true;
    }

    if (addr >> 24) == (cfg.flash_base >> 24) {
        return true;
    }

    false
}

/// Validates an already-offset address and its 256-byte span (the largest
/// span a single read or write frame can name).
pub fn check_addr_span(cfg: &BootCfg, addr: u32) -> bool {
    check_addr(cfg, addr) && check_addr(cfg, addr.wrapping_add(0xFF))
}

/// If byte `addr + i` (for `i` in `0..len`) falls within the flash-size
/// identifier half-word, return the corrected substitute byte (low byte at
/// the lower address) instead of the raw flash contents.
pub fn flash_size_substitute(cfg: &BootCfg, addr: u32, i: u32) -> Option<u8> {
    let target = addr.wrapping_add(i);
    let reported = cfg.reported_flash_size_kib();
    if target == cfg.flash_size_id_addr {
        Some((reported & 0xFF) as u8)
    } else if target == cfg.flash_size_id_addr + 1 {
        Some((reported >> 8) as u8)
    } else {
        None
    }
}
