// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! At-rest record layout.
//!
//! Two record formats coexist. Variable mode lays entries out at increasing
//! offsets as
//!
//! ```text
//! payload[len] | 0xFF × pad(len) | crc:16 | len:16 | key:32 | end:32
//! ```
//!
//! with all integers little-endian. The trailing end-marker word is the
//! commit point: until it is programmed, no reader can find the entry.
//! Fixed mode packs one record per 4-byte cell, value first.

use core::mem::size_of;

use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// The 4-byte word that commits a variable-mode entry.
pub(crate) const END_MARKER: u32 = 0x0000_0000;

/// Variable-mode key reserved to mean "no entry".
pub(crate) const RESERVED_KEY: u32 = 0xFFFF_FFFF;

/// Fixed-mode cell value of a fully erased (free) cell.
pub(crate) const FREE_CELL: u32 = 0xFFFF_FFFF;

/// Fixed-mode key reserved to mean "empty"; doubles as the cache sentinel.
pub(crate) const CELL_SENTINEL: u16 = 0xFFFF;

/// Casts the leading bytes of `bytes` to a layout struct.
pub(crate) fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
where
    T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

/// Trailer closing a variable-mode entry.
///
/// Written after the payload and its padding, in this order, so the end
/// marker lands last.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct EntryTail {
    /// XMODEM CRC-16 over the payload bytes (padding excluded).
    pub crc: U16LE,
    /// Payload length in bytes.
    pub len: U16LE,
    /// Record key.
    pub key: U32LE,
    /// Commit marker; always `END_MARKER` once the entry is live.
    pub end: U32LE,
}

impl EntryTail {
    pub(crate) const SIZE: u32 = size_of::<Self>() as u32;
}

/// Erased filler bytes between the payload and the trailer.
pub(crate) fn padding(len: u16) -> u32 {
    (4 - u32::from(len) % 4) % 4
}

/// Total on-page footprint of an entry with a `len`-byte payload.
pub(crate) fn entry_size(len: u16) -> u32 {
    u32::from(len) + padding(len) + EntryTail::SIZE
}

/// Smallest possible entry footprint (one payload byte).
pub(crate) const MIN_ENTRY_SIZE: u32 = 16;

/// CRC over a payload: polynomial 0x1021, zero seed, no reflection.
pub(crate) fn payload_crc(payload: &[u8]) -> u16 {
    let algo = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);
    let mut digest = algo.digest();
    digest.update(payload);
    digest.finalize()
}

/// One fixed-mode record: a value and the cell index that owns it.
///
/// A cell is free iff all four bytes are still 0xFF.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct Cell {
    pub value: U16LE,
    pub key: U16LE,
}

impl Cell {
    pub(crate) const SIZE: u32 = size_of::<Self>() as u32;

    pub(crate) fn new(key: u16, value: u16) -> Self {
        Self {
            value: value.into(),
            key: key.into(),
        }
    }

    /// Reassembles a cell from the raw little-endian word at its offset.
    pub(crate) fn from_word(word: u32) -> Self {
        Self::new((word >> 16) as u16, word as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_completes_words() {
        assert_eq!(padding(1), 3);
        assert_eq!(padding(2), 2);
        assert_eq!(padding(3), 1);
        assert_eq!(padding(4), 0);
        assert_eq!(padding(5), 3);
    }

    #[test]
    fn entry_sizes() {
        // payload + padding + crc + len + key + end marker
        assert_eq!(entry_size(1), MIN_ENTRY_SIZE);
        assert_eq!(entry_size(4), 16);
        assert_eq!(entry_size(5), 20);
        assert_eq!(entry_size(6), 20);
        assert_eq!(entry_size(13), 28);
    }

    #[test]
    fn tail_layout_is_twelve_little_endian_bytes() {
        let tail = EntryTail {
            crc: 0x1122.into(),
            len: 0x0006.into(),
            key: 0xABCD_EF01.into(),
            end: END_MARKER.into(),
        };
        assert_eq!(
            tail.as_bytes(),
            &[0x22, 0x11, 0x06, 0x00, 0x01, 0xEF, 0xCD, 0xAB, 0x00, 0x00, 0x00, 0x00]
        );

        let (parsed, rest) = cast_prefix::<EntryTail>(tail.as_bytes());
        assert_eq!(*parsed, tail);
        assert!(rest.is_empty());
    }

    #[test]
    fn crc_matches_xmodem_check_value() {
        // The standard check string for CRC-16/XMODEM.
        assert_eq!(payload_crc(b"123456789"), 0x31C3);
        assert_eq!(payload_crc(b""), 0x0000);
    }

    #[test]
    fn cell_round_trip() {
        let cell = Cell::new(0x00AB, 0x1234);
        assert_eq!(cell.as_bytes(), &[0x34, 0x12, 0xAB, 0x00]);
        assert_eq!(Cell::from_word(u32::from_le_bytes([0x34, 0x12, 0xAB, 0x00])), cell);
        assert_eq!(Cell::from_word(FREE_CELL).key.get(), CELL_SENTINEL);
    }
}
