//! Concrete [`FlashFacade`] implementations: raw register sequences for the
//! two STM32 families this bootloader supports. Everything above this
//! crate only ever sees [`bootrom_core::FlashStatus`]; the unlock key
//! sequences, status-flag bits, and per-family erase grammar live here.
#![no_std]

use bootrom_core::config::{BootCfg, EraseGrammar};
use bootrom_core::{FlashFacade, FlashStatus};
use ringbuf::*;

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    EraseStart,
    EraseSector(u32),
    EraseDone,
    WriteStart(u32),
    WriteDone,
    None,
}

ringbuf!(Trace, 32, Trace::None);

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

#[cfg(feature = "family-a")]
pub mod family_a {
    //! STM32F100x ("value line"): uniform 1 KiB pages, `FLASH->AR` + `PER`
    //! page erase, option-byte `RDPRT` for readout protection.

    use super::*;
    use stm32f1::stm32f100 as device;

    pub struct Flash {
        flash: device::FLASH,
    }

    impl Flash {
        pub fn new(flash: device::FLASH) -> Self {
            Flash { flash }
        }

        fn wait_busy(&self) {
            while self.flash.sr.read().bsy().bit_is_set() {}
        }

        fn status(&self) -> FlashStatus {
            let sr = self.flash.sr.read();
            if sr.wrprterr().bit_is_set() {
                FlashStatus::WriteProtected
            } else if sr.pgerr().bit_is_set() {
                FlashStatus::ProgrammingError
            } else if sr.eop().bit_is_set() {
                FlashStatus::Complete
            } else {
                FlashStatus::SequenceError
            }
        }
    }

    impl FlashFacade for Flash {
        fn unlock(&mut self) {
            self.flash.keyr.write(|w| unsafe { w.bits(KEY1) });
            self.flash.keyr.write(|w| unsafe { w.bits(KEY2) });
        }

        fn lock(&mut self) {
            self.flash.cr.modify(|_, w| w.lock().set_bit());
        }

        fn clear_errors(&mut self) {
            self.flash.sr.write(|w| {
                w.eop()
                    .set_bit()
                    .pgerr()
                    .set_bit()
                    .wrprterr()
                    .set_bit()
            });
        }

        fn program_word(&mut self, addr: u32, value: u32) -> FlashStatus {
            ringbuf_entry!(Trace::WriteStart(addr));
            if addr % 4 != 0 {
                return FlashStatus::AlignmentError;
            }
            self.flash.cr.modify(|_, w| w.pg().set_bit());
            let ptr = addr as *mut u16;
            unsafe {
                core::ptr::write_volatile(ptr, (value & 0xFFFF) as u16);
                self.wait_busy();
                core::ptr::write_volatile(
                    ptr.add(1),
                    ((value >> 16) & 0xFFFF) as u16,
                );
                self.wait_busy();
            }
            let status = self.status();
            self.flash.cr.modify(|_, w| w.pg().clear_bit());
            ringbuf_entry!(Trace::WriteDone);
            status
        }

        fn erase_application(&mut self, cfg: &BootCfg) -> FlashStatus {
            let EraseGrammar::MassErasePages { page_size } = cfg.erase else {
                return FlashStatus::SequenceError;
            };
            ringbuf_entry!(Trace::EraseStart);
            let end = cfg.flash_base + cfg.flash_size_bytes;
            let mut addr = cfg.bootloader_to;
            let mut status = FlashStatus::Complete;
            while addr < end {
                ringbuf_entry!(Trace::EraseSector(addr));
                self.flash.cr.modify(|_, w| w.per().set_bit());
                self.flash.ar.write(|w| unsafe { w.bits(addr) });
                self.flash.cr.modify(|_, w| w.strt().set_bit());
                self.wait_busy();
                status = self.status();
                self.flash.cr.modify(|_, w| w.per().clear_bit());
                if !status.is_complete() {
                    break;
                }
                addr += page_size;
            }
            ringbuf_entry!(Trace::EraseDone);
            status
        }

        fn readout_protection_enabled(&self) -> bool {
            self.flash.obr.read().rdprt().bit_is_set()
        }

        fn read_byte(&self, addr: u32) -> u8 {
            unsafe { core::ptr::read_volatile(addr as *const u8) }
        }
    }
}

#[cfg(feature = "family-b")]
pub mod family_b {
    //! STM32F4xx: `SNB`/`SER` sector erase, starting at sector 1 (the
    //! reserved bootloader region occupies sector 0).

    use super::*;
    use stm32f4::stm32f413 as device;

    pub struct Flash {
        flash: device::FLASH,
    }

    impl Flash {
        pub fn new(flash: device::FLASH) -> Self {
            Flash { flash }
        }

        fn wait_busy(&self) {
            while self.flash.sr.read().bsy().bit_is_set() {}
        }

        fn status(&self) -> FlashStatus {
            let sr = self.flash.sr.read();
            if sr.wrperr().bit_is_set() {
                FlashStatus::WriteProtected
            } else if sr.pgaerr().bit_is_set() {
                FlashStatus::AlignmentError
            } else if sr.operr().bit_is_set()
                || sr.pgperr().bit_is_set()
                || sr.pgserr().bit_is_set()
            {
                FlashStatus::ProgrammingError
            } else if sr.eop().bit_is_set() {
                FlashStatus::Complete
            } else {
                FlashStatus::SequenceError
            }
        }

        fn erase_sector(&mut self, sector: u8) -> FlashStatus {
            ringbuf_entry!(Trace::EraseSector(sector as u32));
            self.flash.cr.modify(|_, w| unsafe {
                w.ser().set_bit().snb().bits(sector).strt().set_bit()
            });
            self.wait_busy();
            let status = self.status();
            self.flash.cr.modify(|_, w| w.ser().clear_bit());
            status
        }
    }

    impl FlashFacade for Flash {
        fn unlock(&mut self) {
            self.flash.keyr.write(|w| unsafe { w.bits(KEY1) });
            self.flash.keyr.write(|w| unsafe { w.bits(KEY2) });
        }

        fn lock(&mut self) {
            self.flash.cr.modify(|_, w| w.lock().set_bit());
        }

        fn clear_errors(&mut self) {
            self.flash.sr.write(|w| {
                w.eop()
                    .set_bit()
                    .operr()
                    .set_bit()
                    .wrperr()
                    .set_bit()
                    .pgaerr()
                    .set_bit()
                    .pgperr()
                    .set_bit()
                    .pgserr()
                    .set_bit()
            });
        }

        fn program_word(&mut self, addr: u32, value: u32) -> FlashStatus {
            ringbuf_entry!(Trace::WriteStart(addr));
            if addr % 4 != 0 {
                return FlashStatus::AlignmentError;
            }
            self.flash
                .cr
                .modify(|_, w| unsafe { w.pg().set_bit().psize().bits(0b10) });
            unsafe { core::ptr::write_volatile(addr as *mut u32, value) };
            self.wait_busy();
            let status = self.status();
            self.flash.cr.modify(|_, w| w.pg().clear_bit());
            ringbuf_entry!(Trace::WriteDone);
            status
        }

        fn erase_application(&mut self, cfg: &BootCfg) -> FlashStatus {
            let EraseGrammar::SectorTriple { sector_sizes } = cfg.erase else {
                return FlashStatus::SequenceError;
            };
            ringbuf_entry!(Trace::EraseStart);
            let mut status = FlashStatus::Complete;
            // Sector 0 holds the bootloader; the erasable plan starts at
            // sector 1, matching the device's fixed (non-uniform) layout.
            for (i, _size) in sector_sizes.iter().enumerate() {
                status = self.erase_sector((i + 1) as u8);
                if !status.is_complete() {
                    break;
                }
            }
            ringbuf_entry!(Trace::EraseDone);
            status
        }

        fn readout_protection_enabled(&self) -> bool {
            self.flash.optcr.read().rdp().bits() != 0xAA
        }

        fn read_byte(&self, addr: u32) -> u8 {
            unsafe { core::ptr::read_volatile(addr as *const u8) }
        }
    }
}
