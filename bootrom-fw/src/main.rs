//! Firmware entry point: UART bring-up, peripheral wiring, and the outer
//! forever loop that repeats the activate → serve → go cycle. Everything
//! that can be expressed independently of a specific chip lives in
//! `bootrom-core`; this binary only supplies the concrete collaborators.
#![no_std]
#![no_main]

extern crate panic_halt;

use bootrom_core::session::{ControlTransfer, Externals};
use bootrom_core::{Session, Xorshift32};
use bootrom_link::UartLink;
use cortex_m_rt::entry;

#[cfg(feature = "family-a")]
mod target {
    pub use bootrom_core::config::STM32F100_LD as CFG;
    pub use bootrom_flash::family_a::Flash;
    pub use stm32f1::stm32f100 as device;

    pub fn init_usart(
        usart: device::USART1,
        rcc: &device::RCC,
    ) -> device::USART1 {
        rcc.apb2enr.modify(|_, w| w.usart1en().set_bit());
        // 500000 baud @ 8 MHz HSI: BRR = f_clk / baud.
        usart.brr.write(|w| unsafe { w.bits(16) });
        usart.cr1.modify(|_, w| {
            w.ue().set_bit().te().set_bit().re().set_bit().pce().set_bit().m().set_bit()
        });
        usart
    }
}

#[cfg(feature = "family-b")]
mod target {
    pub use bootrom_core::config::STM32F4XX_1M as CFG;
    pub use bootrom_flash::family_b::Flash;
    pub use stm32f4::stm32f413 as device;

    pub fn init_usart(
        usart: device::USART1,
        rcc: &device::RCC,
    ) -> device::USART1 {
        rcc.apb2enr.modify(|_, w| w.usart1en().set_bit());
        usart.brr.write(|w| unsafe { w.bits(16) });
        usart.cr1.modify(|_, w| {
            w.ue().set_bit().te().set_bit().re().set_bit().pce().set_bit().m().set_bit()
        });
        usart
    }
}

use target::{init_usart, Flash, CFG};

struct CortexMTransfer;

impl ControlTransfer for CortexMTransfer {
    fn transfer(&mut self, sp: u32, pc: u32) {
        unsafe {
            cortex_m::register::msp::write(sp);
            let entry: extern "C" fn() -> ! = core::mem::transmute(pc);
            entry();
        }
    }
}

#[entry]
fn main() -> ! {
    let dp = target::device::Peripherals::take().unwrap();

    let usart = init_usart(dp.USART1, &dp.RCC);
    let mut link = UartLink::new(UsartIo::new(usart));
    let mut flash = Flash::new(dp.FLASH);
    let mut keystream = Xorshift32::new(0xC0DE_CAFE);
    let mut ctl = CortexMTransfer;

    Session::enforce_readout_protection(&mut link, flash_readout_protected(&flash));

    let (mut session, _has_application) = Session::new(&CFG, &flash);

    loop {
        let mut ext = Externals {
            link: &mut link,
            flash: &mut flash,
            keystream: &mut keystream,
            ctl: &mut ctl,
        };
        session.run_cycle(bootrom_core::link::COMMAND_IDLE_TIMEOUT, &mut ext);
    }
}

fn flash_readout_protected(flash: &Flash) -> bool {
    use bootrom_core::FlashFacade;
    flash.readout_protection_enabled()
}

/// Thin `embedded_hal::serial` adapter over the PAC's raw USART data
/// register; kept in the binary since its register layout is chip-specific.
struct UsartIo {
    usart: target::device::USART1,
}

impl UsartIo {
    fn new(usart: target::device::USART1) -> Self {
        UsartIo { usart }
    }
}

impl embedded_hal::serial::Read<u8> for UsartIo {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, ()> {
        if self.usart.sr.read().rxne().bit_is_set() {
            Ok(self.usart.dr.read().dr().bits() as u8)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}

impl embedded_hal::serial::Write<u8> for UsartIo {
    type Error = ();

    fn write(&mut self, byte: u8) -> nb::Result<(), ()> {
        if self.usart.sr.read().txe().bit_is_set() {
            self.usart.dr.write(|w| unsafe { w.dr().bits(u16::from(byte)) });
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn flush(&mut self) -> nb::Result<(), ()> {
        if self.usart.sr.read().tc().bit_is_set() {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}
