// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-mode engine: 16-bit values keyed by cell index.
//!
//! Records are 4-byte cells appended to the active page; the newest cell for
//! an index wins. A RAM cache mirrors the newest-per-index projection of the
//! active page, accelerates reads, and absorbs deferred writes: a cache-only
//! write touches no flash until [`FixedEeprom::write_cache_to_flash`] runs a
//! page transfer, which is implemented as a dump of the cache onto the fresh
//! page.

use zerocopy::AsBytes;

use crate::entry::{Cell, CELL_SENTINEL, FREE_CELL};
use crate::flash::{self, Flash, PageId};
use crate::header::{HeaderEncoding, PageStatus};
use crate::pages;
use crate::recovery::{self, Step};
use crate::Config;

/// Things that can go wrong while reading a value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadError<E> {
    /// No record exists for the address.
    NoVar,
    /// Neither page is in a usable state.
    NoPage,
    /// The address is outside the cell index space.
    BadAddress,
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for ReadError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// Things that can go wrong while writing a value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteError<E> {
    /// The page is full and a transfer-and-retry was already performed.
    PageFull,
    /// Neither page is in a usable state.
    NoPage,
    /// The address is reserved or outside the cell index space.
    BadAddress,
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for WriteError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// The fixed-mode engine.
///
/// `cache` is caller-allocated RAM, one `u16` slot per cell index (so at
/// least `PAGE_SIZE / 4 - 1` slots), borrowed for the engine's lifetime the
/// same way the flash adapter is owned by it.
pub struct FixedEeprom<'b, F: Flash> {
    flash: F,
    cache: &'b mut [u16],
    encoding: HeaderEncoding,
    use_factory: bool,
    /// Offset the next append will land on, when known.
    next_write: Option<u32>,
}

impl<'b, F: Flash> FixedEeprom<'b, F> {
    /// One past the highest valid cell address.
    pub fn address_limit() -> u16 {
        (F::PAGE_SIZE / Cell::SIZE - 1) as u16
    }

    /// Wraps `flash`. No storage access happens until [`init`](Self::init).
    pub fn new(flash: F, cache: &'b mut [u16], config: Config) -> Self {
        // Cells are the programming granularity of this mode.
        assert!(F::WRITE_ALIGN == 4);
        assert!(F::PAGE_SIZE % 4 == 0);
        assert!(cache.len() >= usize::from(Self::address_limit()));
        cache.fill(CELL_SENTINEL);
        Self {
            flash,
            cache,
            encoding: config.encoding,
            use_factory: config.use_factory_page,
            next_write: None,
        }
    }

    /// Borrows the adapter, for diagnostics.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    #[cfg(test)]
    fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    //////////////////////////////////////////////////////////////////////
    // Init and recovery.

    /// Prepares the adapter, repairs the page pair, and rebuilds the cache.
    ///
    /// Every inconsistent header pair is driven back to one ACTIVE page and
    /// one FORMATTED standby, reformatting as the last resort; an error is
    /// returned only if the adapter itself fails. A consistent pair is left
    /// untouched, so a benign init performs no erase.
    pub fn init(&mut self) -> Result<(), F::Error> {
        self.flash.init()?;
        self.next_write = None;

        let p1 = self.encoding.read_status(&self.flash, PageId::One)?;
        let p2 = self.encoding.read_status(&self.flash, PageId::Two)?;

        for step in recovery::plan(p1, p2).steps() {
            match step {
                Step::Erase(page) => self.flash.erase_page(page)?,
                Step::Mark(page, status) => self.encoding.mark(&mut self.flash, page, status)?,
                Step::Transfer { from, to } => {
                    // The cache is the vehicle of a transfer, so fill it
                    // from the surviving source first.
                    let resumed = match self.load_cache(from) {
                        Ok(true) => self.transfer_into(from, to).is_ok(),
                        _ => false,
                    };
                    if !resumed {
                        self.format()?;
                    }
                }
                Step::Format => self.format()?,
            }
        }

        if !self.rebuild_cache()? {
            self.format()?;
        }
        Ok(())
    }

    /// Destructive reset: erase both pages, seed Page 1 from the factory
    /// image when configured, and restore the canonical status pair.
    pub fn format(&mut self) -> Result<(), F::Error> {
        self.flash.erase_page(PageId::One)?;
        self.flash.erase_page(PageId::Two)?;

        if self.use_factory
            && self.encoding.read_status(&self.flash, PageId::Factory)? == PageStatus::Active
        {
            pages::copy_factory_image(&mut self.flash)?;
        }

        self.encoding.mark(&mut self.flash, PageId::One, PageStatus::Active)?;
        self.encoding.mark(&mut self.flash, PageId::Two, PageStatus::Formatted)?;

        self.cache.fill(CELL_SENTINEL);
        self.next_write = None;
        Ok(())
    }

    /// Diagnostic view of a page's lifecycle state.
    pub fn page_status(&self, page: PageId) -> Result<PageStatus, F::Error> {
        self.encoding.read_status(&self.flash, page)
    }

    fn rebuild_cache(&mut self) -> Result<bool, F::Error> {
        match pages::find_read_page(&self.flash, self.encoding)? {
            Some(page) => self.load_cache(page),
            None => Ok(false),
        }
    }

    /// One backward pass over `page`; the newest cell per address wins.
    /// Returns `Ok(false)` when the page holds an address outside the index
    /// space, which marks the whole page untrustworthy.
    fn load_cache(&mut self, page: PageId) -> Result<bool, F::Error> {
        self.cache.fill(CELL_SENTINEL);

        let header = self.encoding.header_len();
        let mut offset = F::PAGE_SIZE;
        while offset > header {
            offset -= Cell::SIZE;
            let word = flash::read_u32(&self.flash, page, offset)?;
            if word == FREE_CELL {
                continue;
            }
            let cell = Cell::from_word(word);
            if cell.key.get() >= Self::address_limit() {
                return Ok(false);
            }
            let slot = &mut self.cache[usize::from(cell.key.get())];
            if *slot == CELL_SENTINEL {
                *slot = cell.value.get();
            }
        }
        Ok(true)
    }

    //////////////////////////////////////////////////////////////////////
    // Reads.

    /// Returns the newest value recorded for `address`.
    ///
    /// The reserved address 0xFFFF always reads as absent; addresses at or
    /// past the limit are rejected outright.
    pub fn read(&mut self, address: u16) -> Result<u16, ReadError<F::Error>> {
        if address == CELL_SENTINEL {
            return Err(ReadError::NoVar);
        }
        if address >= Self::address_limit() {
            return Err(ReadError::BadAddress);
        }

        let page = pages::find_read_page(&self.flash, self.encoding)?.ok_or(ReadError::NoPage)?;

        let cached = self.cache[usize::from(address)];
        if cached != CELL_SENTINEL {
            return Ok(cached);
        }

        let value = self.scan(page, address)?.ok_or(ReadError::NoVar)?;
        self.cache[usize::from(address)] = value;
        Ok(value)
    }

    /// Walks cells newest-first looking for `address`. Starts at the append
    /// cursor when it is known, skipping the erased tail entirely.
    fn scan(&self, page: PageId, address: u16) -> Result<Option<u16>, F::Error> {
        let header = self.encoding.header_len();
        let mut offset = self.next_write.unwrap_or(F::PAGE_SIZE);
        while offset > header {
            offset -= Cell::SIZE;
            let cell = Cell::from_word(flash::read_u32(&self.flash, page, offset)?);
            if cell.key.get() == address {
                return Ok(Some(cell.value.get()));
            }
        }
        Ok(None)
    }

    //////////////////////////////////////////////////////////////////////
    // Writes.

    /// Records `value` for `address`.
    ///
    /// With `cache_only` set, only the RAM cache changes; the value is lost
    /// on power loss unless [`write_cache_to_flash`](Self::write_cache_to_flash)
    /// runs first. Otherwise the value is appended to the active page, and a
    /// full page triggers exactly one transfer and one retry.
    pub fn write(
        &mut self,
        address: u16,
        value: u16,
        cache_only: bool,
    ) -> Result<(), WriteError<F::Error>> {
        if address >= Self::address_limit() {
            return Err(WriteError::BadAddress);
        }

        match self.write_internal(address, value, cache_only) {
            Err(WriteError::PageFull) => {
                self.page_transfer()?;
                self.write_internal(address, value, cache_only)
            }
            other => other,
        }
    }

    fn write_internal(
        &mut self,
        address: u16,
        value: u16,
        cache_only: bool,
    ) -> Result<(), WriteError<F::Error>> {
        let page =
            pages::find_write_page(&self.flash, self.encoding)?.ok_or(WriteError::NoPage)?;

        if !cache_only {
            self.append(page, address, value)?;
        }
        self.cache[usize::from(address)] = value;
        Ok(())
    }

    fn append(&mut self, page: PageId, address: u16, value: u16) -> Result<(), WriteError<F::Error>> {
        let offset = match self.next_write {
            Some(offset) => offset,
            None => self.seek_free_cell(page)?,
        };
        if offset + Cell::SIZE > F::PAGE_SIZE {
            return Err(WriteError::PageFull);
        }

        let cell = Cell::new(address, value);
        self.flash.begin_write(page, offset)?;
        self.flash.write(page, offset, cell.as_bytes())?;
        self.flash.end_write(page)?;

        self.next_write = Some(offset + Cell::SIZE);
        Ok(())
    }

    /// Forward scan for the first never-programmed cell.
    fn seek_free_cell(&self, page: PageId) -> Result<u32, F::Error> {
        let mut offset = self.encoding.header_len();
        while offset + Cell::SIZE <= F::PAGE_SIZE {
            if flash::read_u32(&self.flash, page, offset)? == FREE_CELL {
                break;
            }
            offset += Cell::SIZE;
        }
        Ok(offset)
    }

    //////////////////////////////////////////////////////////////////////
    // Page transfer.

    /// Forces a compaction onto the standby page.
    pub fn page_transfer(&mut self) -> Result<(), WriteError<F::Error>> {
        let source =
            pages::find_read_page(&self.flash, self.encoding)?.ok_or(WriteError::NoPage)?;
        self.transfer_into(source, source.other())
    }

    /// Makes deferred (cache-only) writes durable.
    ///
    /// The transfer dumps the cache, and the cache is exactly the newest
    /// value per address including anything written cache-only.
    pub fn write_cache_to_flash(&mut self) -> Result<(), WriteError<F::Error>> {
        self.page_transfer()
    }

    fn transfer_into(&mut self, from: PageId, to: PageId) -> Result<(), WriteError<F::Error>> {
        let result = self.transfer_inner(from, to);
        if result.is_err() {
            // The cursor may point into the abandoned destination.
            self.next_write = None;
        }
        result
    }

    fn transfer_inner(&mut self, from: PageId, to: PageId) -> Result<(), WriteError<F::Error>> {
        self.encoding.mark(&mut self.flash, to, PageStatus::Receive)?;
        self.next_write = Some(self.encoding.header_len());

        for address in 0..Self::address_limit() {
            let value = self.cache[usize::from(address)];
            if value == CELL_SENTINEL {
                continue;
            }
            self.append(to, address, value)?;
        }

        pages::finalize_transfer(&mut self.flash, self.encoding, from, to)?;
        Ok(())
    }
}
