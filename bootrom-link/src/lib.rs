//! [`ByteLink`] over any `embedded_hal::serial::{Read, Write}` UART.
//!
//! Baud rate, parity, and pin setup are bring-up concerns handled by the
//! caller before a UART is wrapped here — this crate only ever calls
//! `read()`/`write()` and treats `WouldBlock` as "not ready yet".
#![no_std]

use bootrom_core::ByteLink;
use embedded_hal::serial::{Read, Write};

pub struct UartLink<S> {
    serial: S,
    pending: Option<u8>,
}

impl<S> UartLink<S> {
    pub fn new(serial: S) -> Self {
        UartLink {
            serial,
            pending: None,
        }
    }
}

impl<S> ByteLink for UartLink<S>
where
    S: Read<u8> + Write<u8>,
{
    fn recv_ready(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.serial.read() {
            Ok(b) => {
                self.pending = Some(b);
                true
            }
            Err(nb::Error::WouldBlock) => false,
            // A framing/parity/overrun error on the line: drop it and keep
            // polling, matching the reference bootloader's tolerance for
            // line noise between frames.
            Err(nb::Error::Other(_)) => false,
        }
    }

    fn recv(&mut self) -> u8 {
        self.pending.take().expect("recv() called while not ready")
    }

    fn send(&mut self, byte: u8) {
        loop {
            match self.serial.write(byte) {
                Ok(()) => break,
                Err(nb::Error::WouldBlock) => continue,
                Err(nb::Error::Other(_)) => continue,
            }
        }
        loop {
            match self.serial.flush() {
                Ok(()) => break,
                Err(nb::Error::WouldBlock) => continue,
                Err(nb::Error::Other(_)) => continue,
            }
        }
    }
}
