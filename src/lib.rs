//! Emulated EEPROM over two-page NOR flash.
//!
//! Small variable-length or fixed 16-bit records are appended to one of two
//! wear-leveling pages; filling a page triggers a power-fail-safe transfer
//! of the live records onto the other page. The init-time state machine
//! repairs whatever a power loss left behind.

#![cfg_attr(not(test), no_std)]

pub mod fixed;
pub mod flash;
pub mod header;
pub mod var;

mod entry;
mod pages;
mod recovery;

#[cfg(test)]
mod testutil;

pub use flash::{Flash, PageId};
pub use header::{HeaderEncoding, PageStatus};

pub use fixed::FixedEeprom;
pub use var::VarEeprom;

/// Construction-time engine options.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// How page state is laid out in the header.
    pub encoding: HeaderEncoding,
    /// Whether the factory page seeds `format` and fills in missing records
    /// after init.
    pub use_factory_page: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encoding: HeaderEncoding::Simple,
            use_factory_page: false,
        }
    }
}
