// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage adapter contract.
//!
//! The engine performs no hardware I/O of its own; everything goes through an
//! implementation of the [`Flash`] trait provided by the embedder. The trait
//! models a NOR-style part: reads are free-form, programming can only move
//! bits from 1 to 0, and returning a byte to 0xFF requires erasing a whole
//! page.

/// Designates one of the three pages the engine may address.
///
/// `One` and `Two` are the wear-leveling pair; exactly one of them is
/// normally the active write target. `Factory` is an optional read-only
/// golden image consulted during `format`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageId {
    One,
    Two,
    Factory,
}

impl PageId {
    /// The two data pages, in order.
    pub const DATA: [Self; 2] = [Self::One, Self::Two];

    /// Given a data page, get the _other_ one.
    pub fn other(self) -> Self {
        match self {
            Self::One => Self::Two,
            Self::Two => Self::One,
            // The factory page has no partner.
            Self::Factory => Self::Factory,
        }
    }
}

/// Trait describing the backing storage for the purposes of the engine.
///
/// Each page is exposed as an offset-addressed byte space `[0, PAGE_SIZE)`.
/// The adapter has no knowledge of records or headers, and callers of the
/// engine never see the adapter directly.
pub trait Flash {
    /// Error type that can be produced during accesses.
    type Error;

    /// Bytes per page. Must be a multiple of `WRITE_ALIGN`.
    const PAGE_SIZE: u32;

    /// Alignment, in bytes, of record append offsets. Parts that batch
    /// programming into wider windows (e.g. 256-bit flash words) raise this;
    /// everything else leaves the default.
    const WRITE_ALIGN: u32 = 4;

    /// One-time preparation of the part.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Returns every byte of `page` to 0xFF. Must fail for `Factory`.
    fn erase_page(&mut self, page: PageId) -> Result<(), Self::Error>;

    /// Reads `out.len()` bytes starting at `offset`. Pure and repeatable.
    fn read(&self, page: PageId, offset: u32, out: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` at `offset`. A write that would raise any bit from
    /// 0 to 1 must fail, as must any write to `Factory`.
    fn write(&mut self, page: PageId, offset: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Opens a programming bracket at `offset` (always `WRITE_ALIGN`-aligned)
    /// for adapters that gather writes within an alignment window. Adapters
    /// whose writes are self-committing keep the default no-op.
    fn begin_write(&mut self, page: PageId, offset: u32) -> Result<(), Self::Error> {
        let _ = (page, offset);
        Ok(())
    }

    /// Closes the bracket opened by `begin_write`, flushing anything the
    /// adapter was batching.
    fn end_write(&mut self, page: PageId) -> Result<(), Self::Error> {
        let _ = page;
        Ok(())
    }
}

/// Rounds `offset` up to the next `align` boundary; aligned offsets are
/// returned unchanged.
pub(crate) fn align_up(offset: u32, align: u32) -> u32 {
    match offset % align {
        0 => offset,
        rem => offset + (align - rem),
    }
}

// Every integer on a page is little-endian; these helpers keep the word
// accesses in one place.

pub(crate) fn read_u32<F: Flash>(flash: &F, page: PageId, offset: u32) -> Result<u32, F::Error> {
    let mut bytes = [0; 4];
    flash.read(page, offset, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn read_u64<F: Flash>(flash: &F, page: PageId, offset: u32) -> Result<u64, F::Error> {
    let mut bytes = [0; 8];
    flash.read(page, offset, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub(crate) fn write_u32<F: Flash>(
    flash: &mut F,
    page: PageId,
    offset: u32,
    value: u32,
) -> Result<(), F::Error> {
    flash.write(page, offset, &value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_boundaries() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_up(9, 4), 12);
        assert_eq!(align_up(11, 4), 12);
        assert_eq!(align_up(36, 32), 64);
        assert_eq!(align_up(64, 32), 64);
    }

    #[test]
    fn data_pages_pair_up() {
        assert_eq!(PageId::One.other(), PageId::Two);
        assert_eq!(PageId::Two.other(), PageId::One);
    }
}
