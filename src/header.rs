// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page header codec.
//!
//! The first bytes of every page encode its lifecycle state. Two encodings
//! exist: the original single-word form, and a latched form of four one-way
//! slots used on parts with wide programming windows. Both are arranged so
//! that every state advance only moves bits from 1 to 0 and therefore never
//! needs an intermediate erase.

use num_traits::FromPrimitive;

use crate::flash::{self, Flash, PageId};

/// Lifecycle state of a page.
///
/// Transitions are strictly `Erased` → `Formatted` → (`Active` | `Receive`)
/// → (`Full` | `Active`); only a page erase goes backwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageStatus {
    /// Every byte of the page is 0xFF.
    Erased,
    /// Marked usable but not currently the write target.
    Formatted,
    /// Being filled by a page transfer; contents are partial.
    Receive,
    /// Current write target and source of truth for lookups.
    Active,
    /// No longer writable; its live records await migration. Only the
    /// latched encoding can express this state.
    Full,
}

/// Status words of the simple encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u32)]
enum SimpleWord {
    Active = 0x0000_0000,
    Receive = 0xEEEE_EEEE,
    Formatted = 0xFFFF_EEEE,
    Erased = 0xFFFF_FFFF,
}

/// Value of an untouched latched slot.
const SLOT_ERASED: u64 = 0xFFFF_FFFF_FFFF_FFFF;
/// Value a latched slot is programmed to when its state is reached.
const SLOT_PROGRAMMED: u64 = 0xAAAA_AAAA_AAAA_AAAA;

/// State latched by each slot, by slot index.
const SLOT_STATES: [PageStatus; 4] = [
    PageStatus::Formatted,
    PageStatus::Receive,
    PageStatus::Full,
    PageStatus::Active,
];

/// Selects how page state is laid out in the header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeaderEncoding {
    /// One little-endian status word in the first 4 bytes.
    Simple,
    /// Four u64 slots in the first 32 bytes, programmed in turn.
    Latched,
}

impl HeaderEncoding {
    /// Number of header bytes reserved at the start of every page.
    pub const fn header_len(self) -> u32 {
        match self {
            Self::Simple => 4,
            Self::Latched => 32,
        }
    }

    /// Decodes the state of `page` from its header.
    pub fn read_status<F: Flash>(self, flash: &F, page: PageId) -> Result<PageStatus, F::Error> {
        match self {
            Self::Simple => {
                let word = flash::read_u32(flash, page, 0)?;
                Ok(match SimpleWord::from_u32(word) {
                    Some(SimpleWord::Erased) => PageStatus::Erased,
                    Some(SimpleWord::Receive) => PageStatus::Receive,
                    Some(SimpleWord::Active) => PageStatus::Active,
                    // Unrecognized words read back as FORMATTED, matching
                    // images written by earlier generations.
                    Some(SimpleWord::Formatted) | None => PageStatus::Formatted,
                })
            }
            Self::Latched => {
                // The highest programmed slot wins.
                for slot in (0..4u32).rev() {
                    match flash::read_u64(flash, page, slot * 8)? {
                        SLOT_PROGRAMMED => return Ok(SLOT_STATES[slot as usize]),
                        SLOT_ERASED => continue,
                        // A slot holding anything else marks the whole
                        // header untrustworthy.
                        _ => return Ok(PageStatus::Erased),
                    }
                }
                Ok(PageStatus::Erased)
            }
        }
    }

    /// Advances the header of `page` to `status` using only 1→0 bit
    /// transitions. `Erased` is not a markable state (that is what
    /// `erase_page` is for), and the simple encoding cannot express `Full`;
    /// both requests are ignored.
    pub fn mark<F: Flash>(
        self,
        flash: &mut F,
        page: PageId,
        status: PageStatus,
    ) -> Result<(), F::Error> {
        match self {
            Self::Simple => {
                let word = match status {
                    PageStatus::Formatted => SimpleWord::Formatted,
                    PageStatus::Receive => SimpleWord::Receive,
                    PageStatus::Active => SimpleWord::Active,
                    PageStatus::Erased | PageStatus::Full => return Ok(()),
                };
                flash::write_u32(flash, page, 0, word as u32)
            }
            Self::Latched => {
                let slot = match status {
                    PageStatus::Formatted => 0,
                    PageStatus::Receive => 1,
                    PageStatus::Full => 2,
                    PageStatus::Active => 3,
                    PageStatus::Erased => return Ok(()),
                };
                flash.write(page, slot * 8, &SLOT_PROGRAMMED.to_le_bytes())
            }
        }
    }
}
