//! Compile-time layout describing one target family.
//!
//! Mirrors the `#ifdef STM32F10X_LD_VL` / `#ifdef STM32F4XX` split in the
//! reference bootloader: rather than conditional compilation, each family is
//! a `const` [`BootCfg`] value and the engine is generic over it.

use static_assertions::const_assert;

/// How the mass-erase command for a family is framed and carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseGrammar {
    /// Family A: a length frame carrying the literal value 256 triggers a
    /// page-by-page erase of the whole application region.
    MassErasePages { page_size: u32 },
    /// Family B: the literal 3-byte sequence `FF FF 00` triggers a
    /// sector-by-sector erase using the device's fixed sector plan.
    ///
    /// `sector_sizes` lists the sectors to erase, in order, starting from
    /// the first sector above the bootloader region.
    SectorTriple { sector_sizes: &'static [u32] },
}

#[derive(Debug, Clone, Copy)]
pub struct BootCfg {
    pub flash_base: u32,
    pub flash_size_bytes: u32,
    pub sram_base: u32,
    pub bootloader_from: u32,
    pub bootloader_to: u32,
    pub flash_size_id_addr: u32,
    pub pid: u16,
    pub erase: EraseGrammar,
    /// `go()` on some families ignores the requested address (once it has
    /// been validated to equal `bootloader_to`) and always jumps here
    /// instead. `None` means the requested address is used as-is.
    pub go_override: Option<u32>,
}

impl BootCfg {
    /// `FLASH_SIZE_BYTES - BOOTLOADER_SIZE`, in KiB, as reported to the host
    /// in place of the device's physical flash size (see `check_addr`).
    pub const fn reported_flash_size_kib(&self) -> u16 {
        ((self.flash_size_bytes - (self.bootloader_to - self.flash_base)) / 1024) as u16
    }
}

const_assert!(STM32F100_LD.bootloader_from <= STM32F100_LD.bootloader_to);
const_assert!(STM32F4XX_1M.bootloader_from <= STM32F4XX_1M.bootloader_to);
const_assert!(STM32F4XX_512K.bootloader_from <= STM32F4XX_512K.bootloader_to);

/// STM32F100x "low/medium density value line" (Family A): uniform 1 KiB
/// pages, mass erase only, `go()` accepts any validated address.
pub const STM32F100_LD: BootCfg = BootCfg {
    flash_base: 0x0800_0000,
    flash_size_bytes: 128 * 1024,
    sram_base: 0x2000_0000,
    bootloader_from: 0x0800_0000,
    bootloader_to: 0x0800_0000 + 0x4000,
    flash_size_id_addr: 0x1FFF_F7E0,
    pid: 0x420,
    erase: EraseGrammar::MassErasePages { page_size: 1024 },
    go_override: None,
};

// F4 sector plan, 1 MiB part: sectors 0-3 are 16 KiB, sector 4 is 64 KiB,
// sectors 5-11 are 128 KiB each. The bootloader occupies sector 0 only
// (0x8000 covers sectors 0 and 1); erase walks sectors 1 through 11,
// matching the reference implementation exactly.
const F4_SECTORS_1M: [u32; 11] = [
    16384, 65536, 131072, 131072, 131072, 131072, 131072, 131072, 131072, 131072, 131072,
];
const F4_SECTORS_512K: [u32; 8] = [16384, 65536, 131072, 131072, 131072, 131072, 131072, 131072];

/// STM32F4xx, 1 MiB flash variant (Family B).
pub const STM32F4XX_1M: BootCfg = BootCfg {
    flash_base: 0x0800_0000,
    flash_size_bytes: 1024 * 1024,
    sram_base: 0x2000_0000,
    bootloader_from: 0x0800_0000,
    bootloader_to: 0x0800_0000 + 0x8000,
    flash_size_id_addr: 0x1FFF_7A22,
    pid: 0x413,
    erase: EraseGrammar::SectorTriple {
        sector_sizes: &F4_SECTORS_1M,
    },
    go_override: Some(0x0800_0000 + 0x10000),
};

/// STM32F4xx, 512 KiB flash variant (Family B), which stops erasing after
/// the sector containing the end of its smaller flash array.
pub const STM32F4XX_512K: BootCfg = BootCfg {
    flash_size_bytes: 512 * 1024,
    erase: EraseGrammar::SectorTriple {
        sector_sizes: &F4_SECTORS_512K,
    },
    ..STM32F4XX_1M
};
