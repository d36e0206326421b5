//! Protocol/command engine, flash-obfuscation, and safety policy for a
//! USART in-application-programming bootloader. UART bring-up, the
//! concrete flash controller, and the entropy source backing the keystream
//! all live outside this crate; this crate only defines the traits they
//! implement.
#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod flash;
pub mod framing;
pub mod keystream;
pub mod link;
pub mod linearity;
pub mod region;
pub mod session;

pub use config::BootCfg;
pub use flash::{FlashFacade, FlashStatus};
pub use keystream::{Keystream, Xorshift32};
pub use link::ByteLink;
pub use session::{ControlTransfer, Externals, Session};
