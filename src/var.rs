// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Variable-mode engine: CRC-protected byte strings keyed by `u32`.
//!
//! Entries are appended after the page header; each one closes with a
//! trailer whose end-marker word is the commit point, so a write torn by
//! power loss is simply never found. Lookups walk the log newest-first,
//! striding over whole entries using the length recorded in the trailer.
//! When the active page fills, the newest record for each key is replayed
//! onto the other page and the old page is recycled.

use crate::entry::{
    self, entry_size, padding, payload_crc, EntryTail, END_MARKER, MIN_ENTRY_SIZE, RESERVED_KEY,
};
use crate::flash::{self, align_up, Flash, PageId};
use crate::header::{HeaderEncoding, PageStatus};
use crate::pages;
use crate::recovery::{self, Step};
use crate::Config;

use zerocopy::AsBytes;

/// Things that can go wrong while reading a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadError<E> {
    /// No record exists for the key.
    NoIndex,
    /// Neither page is in a usable state.
    NoPage,
    /// The record exists but its payload exceeds the output buffer.
    BufferTooSmall,
    /// The newest record for the key fails its CRC check.
    InvalidCrc,
    /// The page contents are inconsistent (bad lengths or markers).
    Corrupt,
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for ReadError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// Things that can go wrong while writing a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteError<E> {
    /// The entry does not fit: either the payload can never fit on a page,
    /// or a transfer-and-retry was already performed.
    PageFull,
    /// Neither page is in a usable state.
    NoPage,
    /// The key value reserved for empty space was supplied.
    ReservedKey,
    /// Zero-length payloads cannot be stored.
    EmptyPayload,
    /// Inconsistent on-page data was encountered during a transfer.
    Corrupt,
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for WriteError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// Failure of the low-level page walk; widened into the public error kinds
/// at the call sites.
enum ScanError<E> {
    Corrupt,
    Flash(E),
}

impl<E> From<E> for ScanError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

impl<E> From<ScanError<E>> for ReadError<E> {
    fn from(e: ScanError<E>) -> Self {
        match e {
            ScanError::Corrupt => Self::Corrupt,
            ScanError::Flash(e) => Self::Flash(e),
        }
    }
}

impl<E> From<ScanError<E>> for WriteError<E> {
    fn from(e: ScanError<E>) -> Self {
        match e {
            ScanError::Corrupt => Self::Corrupt,
            ScanError::Flash(e) => Self::Flash(e),
        }
    }
}

/// A committed entry found by the scanner.
#[derive(Copy, Clone, Debug)]
struct Located {
    /// Offset of the first payload byte.
    start: u32,
    key: u32,
    len: u16,
    crc: u16,
}

/// The variable-mode engine.
///
/// `transferred` is caller-allocated scratch used to remember which keys
/// have already been replayed during a page transfer; it needs one slot per
/// record that can fit on a page.
pub struct VarEeprom<'b, F: Flash> {
    flash: F,
    transferred: &'b mut [u32],
    transferred_len: usize,
    encoding: HeaderEncoding,
    use_factory: bool,
    /// Offset the next append will land on, when known.
    next_write: Option<u32>,
}

impl<'b, F: Flash> VarEeprom<'b, F> {
    /// Upper bound on the number of records a page can hold.
    pub fn max_records() -> usize {
        ((F::PAGE_SIZE - 4 - 4) / MIN_ENTRY_SIZE) as usize
    }

    /// Wraps `flash`. No storage access happens until [`init`](Self::init).
    pub fn new(flash: F, transferred: &'b mut [u32], config: Config) -> Self {
        assert!(F::WRITE_ALIGN % 4 == 0);
        assert!(F::PAGE_SIZE % F::WRITE_ALIGN == 0);
        assert!(F::PAGE_SIZE > config.encoding.header_len() + 2 * MIN_ENTRY_SIZE);
        assert!(transferred.len() >= Self::max_records());
        Self {
            flash,
            transferred,
            transferred_len: 0,
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

    #[cfg(test)]
    fn into_flash(self) -> F {
        self.flash
    }

    //////////////////////////////////////////////////////////////////////
    // Init and recovery.

    /// Prepares the adapter and repairs the page pair.
    ///
    /// Interrupted transfers are resumed or restarted depending on which
    /// side survived; irreparable pairs are formatted. An error is returned
    /// only when the adapter itself fails. With the factory page enabled,
    /// records present in the factory image but missing from the active
    /// page are seeded in afterwards.
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
                    let redone = self.transfer(from, to).is_ok();
                    self.clear_transferred();
                    if !redone {
                        self.next_write = None;
                        self.format()?;
                    }
                }
                Step::Format => self.format()?,
            }
        }

        if self.use_factory {
            self.seed_factory()?;
        }
        Ok(())
    }

    /// Destructive reset: erase both pages, seed Page 1 from the factory
    /// image when configured, and restore the canonical status pair.
    pub fn format(&mut self) -> Result<(), F::Error> {
        self.flash.erase_page(PageId::One)?;
        self.flash.erase_page(PageId::Two)?;

        let seeded = self.use_factory
            && self.encoding.read_status(&self.flash, PageId::Factory)? == PageStatus::Active;
        if seeded {
            pages::copy_factory_image(&mut self.flash)?;
        }

        self.encoding.mark(&mut self.flash, PageId::One, PageStatus::Active)?;
        if !seeded {
            // Anchor the empty log; the factory image brings its own.
            self.write_anchor(PageId::One)?;
        }
        self.encoding.mark(&mut self.flash, PageId::Two, PageStatus::Formatted)?;

        self.next_write = None;
        Ok(())
    }

    /// Diagnostic view of a page's lifecycle state.
    pub fn page_status(&self, page: PageId) -> Result<PageStatus, F::Error> {
        self.encoding.read_status(&self.flash, page)
    }

    fn write_anchor(&mut self, page: PageId) -> Result<(), F::Error> {
        let header = self.encoding.header_len();
        self.flash.begin_write(page, header)?;
        flash::write_u32(&mut self.flash, page, header, END_MARKER)?;
        self.flash.end_write(page)
    }

    //////////////////////////////////////////////////////////////////////
    // Scanning.

    /// Finds the next committed entry strictly below `*pos`, leaving `*pos`
    /// at that entry's first payload byte so repeated calls walk the log
    /// newest-first. Returns `None` at the anchor marker or the header.
    fn next_entry(
        &self,
        page: PageId,
        pos: &mut u32,
    ) -> Result<Option<Located>, ScanError<F::Error>> {
        let header = self.encoding.header_len();

        loop {
            if *pos <= header {
                return Ok(None);
            }
            let word_at = *pos - 4;
            if flash::read_u32(&self.flash, page, word_at)? != END_MARKER {
                // Erased space, or the innards of an entry we will stride
                // over once its marker turns up.
                *pos = word_at;
                continue;
            }
            if word_at == header {
                // The anchor written at format/transfer time; nothing older.
                return Ok(None);
            }

            let mut bytes = [0; 12];
            self.flash.read(page, word_at - 8, &mut bytes)?;
            let (tail, _) = entry::cast_prefix::<EntryTail>(&bytes);
            let len = tail.len.get();
            let size = entry_size(len);
            if len == 0 || size > word_at - header {
                return Err(ScanError::Corrupt);
            }

            let located = Located {
                start: word_at + 4 - size,
                key: tail.key.get(),
                len,
                crc: tail.crc.get(),
            };
            *pos = located.start;
            return Ok(Some(located));
        }
    }

    /// Newest committed entry for `key` on `page`, scanning down from `end`.
    fn find_entry(
        &self,
        page: PageId,
        end: u32,
        key: u32,
    ) -> Result<Option<Located>, ScanError<F::Error>> {
        let mut pos = end;
        while let Some(found) = self.next_entry(page, &mut pos)? {
            if found.key == key {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Where lookups on the active page start: the append cursor when it is
    /// known (skipping the erased tail), else the end of the page.
    fn scan_end(&self) -> u32 {
        self.next_write.unwrap_or(F::PAGE_SIZE)
    }

    //////////////////////////////////////////////////////////////////////
    // Reads.

    /// Copies the newest payload for `key` into `out` and returns its
    /// length.
    ///
    /// The record's CRC is verified against the payload as stored; on
    /// mismatch the error is reported without falling back to older
    /// versions of the key.
    // TODO: consider an opt-in fallback to the previous generation of a key
    // when the newest record fails its CRC.
    pub fn read(&self, key: u32, out: &mut [u8]) -> Result<u16, ReadError<F::Error>> {
        if key == RESERVED_KEY {
            return Err(ReadError::NoIndex);
        }
        let page = pages::find_read_page(&self.flash, self.encoding)?.ok_or(ReadError::NoPage)?;

        let found = self
            .find_entry(page, self.scan_end(), key)?
            .ok_or(ReadError::NoIndex)?;
        if usize::from(found.len) > out.len() {
            return Err(ReadError::BufferTooSmall);
        }

        let out = &mut out[..usize::from(found.len)];
        self.flash.read(page, found.start, out)?;
        if payload_crc(out) != found.crc {
            return Err(ReadError::InvalidCrc);
        }
        Ok(found.len)
    }

    /// Whether any committed record exists for `key`. The payload is not
    /// touched, so no CRC check happens.
    pub fn index_exists(&self, key: u32) -> Result<bool, ReadError<F::Error>> {
        if key == RESERVED_KEY {
            return Ok(false);
        }
        let page = pages::find_read_page(&self.flash, self.encoding)?.ok_or(ReadError::NoPage)?;
        Ok(self.find_entry(page, self.scan_end(), key)?.is_some())
    }

    //////////////////////////////////////////////////////////////////////
    // Writes.

    /// Appends a record for `key`, superseding any previous one.
    ///
    /// Payloads that can never fit on a page are rejected up front; a
    /// transiently full page triggers exactly one transfer and one retry.
    pub fn write(&mut self, key: u32, payload: &[u8]) -> Result<(), WriteError<F::Error>> {
        if key == RESERVED_KEY {
            return Err(WriteError::ReservedKey);
        }
        if payload.is_empty() {
            return Err(WriteError::EmptyPayload);
        }
        let header = self.encoding.header_len();
        let oversized = match u16::try_from(payload.len()) {
            // The header and the anchor marker are never reclaimable.
            Ok(len) => entry_size(len) >= F::PAGE_SIZE - header - 4,
            Err(_) => true,
        };
        if oversized {
            return Err(WriteError::PageFull);
        }

        match self.write_internal(key, payload) {
            Err(WriteError::PageFull) => {
                self.page_transfer()?;
                self.write_internal(key, payload)
            }
            other => other,
        }
    }

    fn write_internal(&mut self, key: u32, payload: &[u8]) -> Result<(), WriteError<F::Error>> {
        let page =
            pages::find_write_page(&self.flash, self.encoding)?.ok_or(WriteError::NoPage)?;
        self.append(page, key, payload)
    }

    fn append(&mut self, page: PageId, key: u32, payload: &[u8]) -> Result<(), WriteError<F::Error>> {
        let len = payload.len() as u16;
        let size = entry_size(len);
        let offset = match self.next_write {
            Some(offset) => offset,
            None => self.seek_append_offset(page)?,
        };
        if offset + size > F::PAGE_SIZE {
            return Err(WriteError::PageFull);
        }

        let tail = EntryTail {
            crc: payload_crc(payload).into(),
            len: len.into(),
            key: key.into(),
            end: END_MARKER.into(),
        };

        self.flash.begin_write(page, offset)?;
        self.flash.write(page, offset, payload)?;
        // Padding bytes stay erased; the trailer lands after them with the
        // commit marker as its final word.
        self.flash
            .write(page, offset + u32::from(len) + padding(len), tail.as_bytes())?;
        self.flash.end_write(page)?;

        self.next_write = Some(align_up(offset + size, F::WRITE_ALIGN));
        Ok(())
    }

    /// Forward placement of the append cursor: just past the last
    /// programmed word, aligned up. Placing it past programmed words rather
    /// than past the last marker keeps the page appendable even when its
    /// tail holds a torn, uncommitted entry.
    fn seek_append_offset(&self, page: PageId) -> Result<u32, F::Error> {
        let header = self.encoding.header_len();
        let mut pos = F::PAGE_SIZE;
        while pos > header {
            if flash::read_u32(&self.flash, page, pos - 4)? != 0xFFFF_FFFF {
                break;
            }
            pos -= 4;
        }
        Ok(align_up(pos.max(header + 4), F::WRITE_ALIGN))
    }

    //////////////////////////////////////////////////////////////////////
    // Page transfer.

    /// Forces a compaction: replays the newest record per key onto the
    /// standby page and recycles the old one.
    pub fn page_transfer(&mut self) -> Result<(), WriteError<F::Error>> {
        let source =
            pages::find_read_page(&self.flash, self.encoding)?.ok_or(WriteError::NoPage)?;
        let result = self.transfer(source, source.other());
        self.clear_transferred();
        if result.is_err() {
            // The cursor may point into the abandoned destination.
            self.next_write = None;
        }
        result
    }

    fn transfer(&mut self, source: PageId, dest: PageId) -> Result<(), WriteError<F::Error>> {
        let source_end = self.next_write.take().unwrap_or(F::PAGE_SIZE);

        self.encoding.mark(&mut self.flash, dest, PageStatus::Receive)?;
        self.write_anchor(dest)?;
        self.next_write = Some(align_up(self.encoding.header_len() + 4, F::WRITE_ALIGN));

        // Newest-first walk: the first record seen for a key is its live
        // one, everything after that is history.
        let mut pos = source_end;
        while let Some(found) = self.next_entry(source, &mut pos)? {
            if self.already_transferred(found.key) {
                continue;
            }
            self.mark_transferred(found.key)?;
            self.copy_entry(source, dest, found)?;
        }

        pages::finalize_transfer(&mut self.flash, self.encoding, source, dest)?;
        Ok(())
    }

    /// Replays one record onto `dest`, re-checking the CRC as the payload
    /// streams through. The trailer goes last, so a torn copy is never
    /// visible to readers.
    fn copy_entry(
        &mut self,
        source: PageId,
        dest: PageId,
        found: Located,
    ) -> Result<(), WriteError<F::Error>> {
        let size = entry_size(found.len);
        let offset = match self.next_write {
            Some(offset) => offset,
            None => self.seek_append_offset(dest)?,
        };
        if offset + size > F::PAGE_SIZE {
            return Err(WriteError::PageFull);
        }

        let algo = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);
        let mut digest = algo.digest();
        let mut chunk = [0; 32];
        let mut copied = 0;

        self.flash.begin_write(dest, offset)?;
        while copied < u32::from(found.len) {
            let n = (u32::from(found.len) - copied).min(chunk.len() as u32) as usize;
            self.flash.read(source, found.start + copied, &mut chunk[..n])?;
            digest.update(&chunk[..n]);
            self.flash.write(dest, offset + copied, &chunk[..n])?;
            copied += n as u32;
        }
        if digest.finalize() != found.crc {
            self.flash.end_write(dest)?;
            return Err(WriteError::Corrupt);
        }

        let tail = EntryTail {
            crc: found.crc.into(),
            len: found.len.into(),
            key: found.key.into(),
            end: END_MARKER.into(),
        };
        self.flash
            .write(dest, offset + u32::from(found.len) + padding(found.len), tail.as_bytes())?;
        self.flash.end_write(dest)?;

        self.next_write = Some(align_up(offset + size, F::WRITE_ALIGN));
        Ok(())
    }

    fn already_transferred(&self, key: u32) -> bool {
        self.transferred[..self.transferred_len].contains(&key)
    }

    fn mark_transferred(&mut self, key: u32) -> Result<(), WriteError<F::Error>> {
        if self.transferred_len == self.transferred.len() {
            // More live keys than a page can hold records: the source page
            // is lying about its contents.
            return Err(WriteError::Corrupt);
        }
        self.transferred[self.transferred_len] = key;
        self.transferred_len += 1;
        Ok(())
    }

    fn clear_transferred(&mut self) {
        self.transferred_len = 0;
    }

    //////////////////////////////////////////////////////////////////////
    // Factory seeding.

    /// Copies factory records whose keys have no counterpart on the active
    /// page. Best-effort: a malformed factory record or a crowded active
    /// page ends the seeding early, and only adapter failures propagate.
    fn seed_factory(&mut self) -> Result<(), F::Error> {
        if self.encoding.read_status(&self.flash, PageId::Factory)? != PageStatus::Active {
            return Ok(());
        }
        let active = match pages::find_read_page(&self.flash, self.encoding)? {
            Some(page) => page,
            None => return Ok(()),
        };

        self.clear_transferred();
        let mut pos = F::PAGE_SIZE;
        loop {
            let found = match self.next_entry(PageId::Factory, &mut pos) {
                Ok(Some(found)) => found,
                Ok(None) | Err(ScanError::Corrupt) => break,
                Err(ScanError::Flash(e)) => {
                    self.clear_transferred();
                    return Err(e);
                }
            };
            if self.already_transferred(found.key) {
                continue;
            }
            if self.mark_transferred(found.key).is_err() {
                break;
            }

            let present = match self.find_entry(active, self.scan_end(), found.key) {
                Ok(hit) => hit.is_some(),
                // Do not stack records onto a page we cannot parse.
                Err(ScanError::Corrupt) => true,
                Err(ScanError::Flash(e)) => {
                    self.clear_transferred();
                    return Err(e);
                }
            };
            if present {
                continue;
            }

            match self.copy_entry(PageId::Factory, active, found) {
                Ok(()) => {}
                Err(WriteError::Flash(e)) => {
                    self.clear_transferred();
                    return Err(e);
                }
                Err(_) => break,
            }
        }
        self.clear_transferred();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RamFlash;
    use crate::HeaderEncoding;

    const PAGE: usize = 1024;
    type Ram = RamFlash<PAGE, 4>;
    type Eeprom<'b> = VarEeprom<'b, Ram>;

    fn fresh_set() -> [u32; 64] {
        [0; 64]
    }

    fn mounted<'b>(set: &'b mut [u32]) -> Eeprom<'b> {
        let mut ee = Eeprom::new(Ram::new(), set, Config::default());
        ee.init().unwrap();
        ee
    }

    fn read_string<'a, F: Flash>(
        ee: &VarEeprom<'_, F>,
        key: u32,
        buf: &'a mut [u8],
    ) -> Result<&'a [u8], ReadError<F::Error>> {
        let len = ee.read(key, buf)?;
        Ok(&buf[..usize::from(len)])
    }

    #[test]
    fn read_non_existing() {
        let mut set = fresh_set();
        let ee = mounted(&mut set);
        let mut buf = [0; 64];
        assert_eq!(ee.read(0x1234, &mut buf), Err(ReadError::NoIndex));
    }

    #[test]
    fn insert_and_rewrite() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        let entries: [(u32, &[u8]); 3] =
            [(0xABCD, b"Hello!"), (0x1234, b"Hi!"), (0x54BA, b"Bonjour!")];
        for (key, text) in entries {
            ee.write(key, text).unwrap();
            assert_eq!(read_string(&ee, key, &mut buf), Ok(text));
        }

        // Same keys, new payloads: the rewrite wins.
        let rewritten: [(u32, &[u8]); 3] = [
            (0xABCD, b"Greetings!"),
            (0x1234, b"This greeting is brought to you by GreetCo LLC"),
            (0x54BA, b"Ola!"),
        ];
        for (key, text) in rewritten {
            ee.write(key, text).unwrap();
            assert_eq!(read_string(&ee, key, &mut buf), Ok(text));
        }

        assert_eq!(ee.read(0xBEEF, &mut buf), Err(ReadError::NoIndex));
    }

    #[test]
    fn survives_reinit() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        ee.write(0xABF4, b"sticks around").unwrap();
        ee.init().unwrap();
        assert_eq!(read_string(&ee, 0xABF4, &mut buf), Ok(b"sticks around".as_slice()));
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; PAGE];

        let blob = [b'A'; PAGE];
        assert_eq!(ee.write(0x42FC, &blob), Err(WriteError::PageFull));
        assert_eq!(ee.read(0x42FC, &mut buf), Err(ReadError::NoIndex));

        // The boundary case: an entry that would leave no room for the
        // header and anchor.
        let edge = [b'A'; PAGE - 4 - 4 - 12];
        assert_eq!(ee.write(0x42FC, &edge), Err(WriteError::PageFull));

        // Just under the limit still stores fine.
        let big = [b'B'; 1000];
        assert_eq!(ee.write(0x42FC, &big), Ok(()));
        assert_eq!(ee.read(0x42FC, &mut buf), Ok(1000));
    }

    #[test]
    fn no_usable_page_reports_no_page() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 16];

        ee.flash_mut().page_mut(PageId::One)[0] = 0xAA;
        ee.flash_mut().page_mut(PageId::Two)[0] = 0xAA;

        assert_eq!(ee.write(1, b"x"), Err(WriteError::NoPage));
        assert_eq!(ee.read(1, &mut buf), Err(ReadError::NoPage));
    }

    #[test]
    fn reserved_key_rejected() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 16];

        assert_eq!(ee.write(0xFFFF_FFFF, b"nope"), Err(WriteError::ReservedKey));
        assert_eq!(ee.read(0xFFFF_FFFF, &mut buf), Err(ReadError::NoIndex));
        assert_eq!(ee.index_exists(0xFFFF_FFFF), Ok(false));
    }

    #[test]
    fn empty_payload_rejected() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        assert_eq!(ee.write(0xABCD, b""), Err(WriteError::EmptyPayload));
    }

    #[test]
    fn buffer_too_small() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        ee.write(7, b"longer than four").unwrap();

        let mut small = [0; 4];
        assert_eq!(ee.read(7, &mut small), Err(ReadError::BufferTooSmall));

        let mut exact = [0; 16];
        assert_eq!(ee.read(7, &mut exact), Ok(16));
    }

    #[test]
    fn index_exists_tracks_writes() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);

        let entries: [(u32, &[u8]); 3] =
            [(0x1234, b"string 1"), (0x5678, b"string 2"), (0x9ABC, b"string 3")];
        for (key, text) in entries {
            assert_eq!(ee.index_exists(key), Ok(false));
            ee.write(key, text).unwrap();
            assert_eq!(ee.index_exists(key), Ok(true));
        }
    }

    #[test]
    fn crc_flip_detected() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 32];

        ee.write(0xCAFE, b"old value").unwrap();
        ee.write(0xCAFE, b"Hello!").unwrap();

        // First entry: [8, 32) for the 9-byte payload (9 + 3 pad + 12).
        // Second entry payload starts right after it.
        let payload = 32;
        ee.flash_mut().page_mut(PageId::One)[payload + 2] ^= 0x01;

        // The newest record reports the damage; the older value is not
        // silently substituted.
        assert_eq!(ee.read(0xCAFE, &mut buf), Err(ReadError::InvalidCrc));
        // Existence checks skip payload verification.
        assert_eq!(ee.index_exists(0xCAFE), Ok(true));
    }

    #[test]
    fn nonsense_length_reports_corrupt() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 32];

        ee.write(0xCAFE, b"Hello!").unwrap();
        // Entry at [8, 28); trailer len field at 8 + 6 + 2 pad + 2.
        let len_field = 8 + 6 + 2 + 2;
        ee.flash_mut().page_mut(PageId::One)[len_field] = 0xF0;
        ee.flash_mut().page_mut(PageId::One)[len_field + 1] = 0x7F;

        assert_eq!(ee.read(0xCAFE, &mut buf), Err(ReadError::Corrupt));
    }

    #[test]
    fn page_transfer_keeps_newest() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        assert_eq!(ee.page_status(PageId::One), Ok(PageStatus::Active));
        assert_eq!(ee.page_status(PageId::Two), Ok(PageStatus::Formatted));

        let text = b"page transfer";
        let rounds = PAGE as u32 / entry_size(text.len() as u16) + 1;
        for _ in 0..rounds {
            ee.write(0xEEEE, text).unwrap();
        }

        assert_eq!(ee.page_status(PageId::One), Ok(PageStatus::Formatted));
        assert_eq!(ee.page_status(PageId::Two), Ok(PageStatus::Active));
        assert_eq!(read_string(&ee, 0xEEEE, &mut buf), Ok(text.as_slice()));

        // A reinit sees the canonical pair and touches nothing.
        ee.flash_mut().erase_count = 0;
        ee.init().unwrap();
        assert_eq!(ee.flash().erase_count, 0);
        assert_eq!(read_string(&ee, 0xEEEE, &mut buf), Ok(text.as_slice()));
    }

    #[test]
    fn repeated_transfers_preserve_content() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        let text = b"page transfer";
        let rounds = (PAGE as u32 / entry_size(text.len() as u16)) * 4;
        for _ in 0..rounds {
            ee.write(0xEEEE, text).unwrap();
        }
        assert_eq!(read_string(&ee, 0xEEEE, &mut buf), Ok(text.as_slice()));
    }

    #[test]
    fn forced_transfer_conserves_the_live_set() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        ee.write(1, b"one").unwrap();
        ee.write(2, b"two").unwrap();
        ee.write(1, b"uno").unwrap();

        ee.flash_mut().erase_count = 0;
        ee.page_transfer().unwrap();
        assert_eq!(ee.flash().erase_count, 1);

        assert_eq!(read_string(&ee, 1, &mut buf), Ok(b"uno".as_slice()));
        assert_eq!(read_string(&ee, 2, &mut buf), Ok(b"two".as_slice()));
        assert_eq!(ee.read(3, &mut buf), Err(ReadError::NoIndex));
    }

    #[test]
    fn interrupted_transfer_restarts_at_init() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        ee.write(0x11, b"survivor").unwrap();

        // Fake a transfer that died right after marking the destination:
        // the source is intact, the destination partially written.
        HeaderEncoding::Simple
            .mark(ee.flash_mut(), PageId::Two, PageStatus::Receive)
            .unwrap();
        ee.flash_mut().page_mut(PageId::Two)[4..8].copy_from_slice(&[0, 0, 0, 0]);
        ee.flash_mut().page_mut(PageId::Two)[8] = 0x5A;

        ee.init().unwrap();

        assert_eq!(ee.page_status(PageId::One), Ok(PageStatus::Formatted));
        assert_eq!(ee.page_status(PageId::Two), Ok(PageStatus::Active));
        assert_eq!(read_string(&ee, 0x11, &mut buf), Ok(b"survivor".as_slice()));
    }

    #[test]
    fn promotes_receiver_when_source_is_gone() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        ee.write(0x22, b"moved").unwrap();

        // Fake the tail end of a transfer: the old page is already erased,
        // the receiving page never got its ACTIVE mark.
        let one = *ee.flash_mut().page_mut(PageId::One);
        *ee.flash_mut().page_mut(PageId::Two) = one;
        ee.flash_mut().page_mut(PageId::Two)[..4].copy_from_slice(&0xEEEE_EEEE_u32.to_le_bytes());
        ee.flash_mut().page_mut(PageId::One).fill(0xFF);

        ee.init().unwrap();

        assert_eq!(ee.page_status(PageId::One), Ok(PageStatus::Formatted));
        assert_eq!(ee.page_status(PageId::Two), Ok(PageStatus::Active));
        assert_eq!(read_string(&ee, 0x22, &mut buf), Ok(b"moved".as_slice()));
    }

    #[test]
    fn factory_image_restored_by_format() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        ee.write(0xA1, b"alpha").unwrap();
        ee.write(0xB2, b"beta").unwrap();
        ee.flash_mut().copy_to_factory();

        let mut flash = ee.into_flash();
        flash.erase_page(PageId::One).unwrap();
        flash.erase_page(PageId::Two).unwrap();

        let mut set = fresh_set();
        let config = Config {
            use_factory_page: true,
            ..Config::default()
        };
        let mut ee = Eeprom::new(flash, &mut set, config);
        ee.init().unwrap();

        assert_eq!(read_string(&ee, 0xA1, &mut buf), Ok(b"alpha".as_slice()));
        assert_eq!(read_string(&ee, 0xB2, &mut buf), Ok(b"beta".as_slice()));

        // The restored page is a normal active page: rewrites land on it.
        ee.write(0xA1, b"alpha2").unwrap();
        assert_eq!(read_string(&ee, 0xA1, &mut buf), Ok(b"alpha2".as_slice()));
    }

    #[test]
    fn missing_factory_records_are_seeded() {
        let mut set = fresh_set();
        let mut ee = mounted(&mut set);
        let mut buf = [0; 64];

        ee.write(0xA1, b"factory a").unwrap();
        ee.write(0xB2, b"factory b").unwrap();
        ee.flash_mut().copy_to_factory();

        // Start over without the factory image, diverging one key.
        ee.format().unwrap();
        ee.write(0xA1, b"local a").unwrap();

        let flash = ee.into_flash();
        let mut set = fresh_set();
        let config = Config {
            use_factory_page: true,
            ..Config::default()
        };
        let mut ee = Eeprom::new(flash, &mut set, config);
        ee.init().unwrap();

        // Present keys keep their local value; absent ones come from the
        // factory image.
        assert_eq!(read_string(&ee, 0xA1, &mut buf), Ok(b"local a".as_slice()));
        assert_eq!(read_string(&ee, 0xB2, &mut buf), Ok(b"factory b".as_slice()));
    }

    #[test]
    fn latched_round_trip_with_wide_alignment() {
        type WideRam = RamFlash<PAGE, 32>;
        let config = Config {
            encoding: HeaderEncoding::Latched,
            ..Config::default()
        };
        let mut set = fresh_set();
        let mut ee = VarEeprom::<WideRam>::new(WideRam::new(), &mut set, config);
        ee.init().unwrap();
        let mut buf = [0; 64];

        ee.write(0x10, b"first").unwrap();
        ee.write(0x20, b"second").unwrap();
        ee.write(0x10, b"first, rewritten").unwrap();

        assert_eq!(read_string(&ee, 0x10, &mut buf), Ok(b"first, rewritten".as_slice()));
        assert_eq!(read_string(&ee, 0x20, &mut buf), Ok(b"second".as_slice()));

        ee.page_transfer().unwrap();
        assert_eq!(ee.page_status(PageId::One), Ok(PageStatus::Formatted));
        assert_eq!(ee.page_status(PageId::Two), Ok(PageStatus::Active));
        assert_eq!(read_string(&ee, 0x10, &mut buf), Ok(b"first, rewritten".as_slice()));

        ee.init().unwrap();
        assert_eq!(read_string(&ee, 0x20, &mut buf), Ok(b"second".as_slice()));
    }

    #[test]
    fn latched_full_page_is_migrated_at_init() {
        let config = Config {
            encoding: HeaderEncoding::Latched,
            ..Config::default()
        };
        let mut set = fresh_set();
        let mut ee = VarEeprom::<Ram>::new(Ram::new(), &mut set, config);
        ee.init().unwrap();
        let mut buf = [0; 64];

        ee.write(0x77, b"pinned").unwrap();

        // Rewind the page's history so it reads as FULL: active slot back
        // to erased, full slot programmed.
        ee.flash_mut().page_mut(PageId::One)[24..32].fill(0xFF);
        ee.flash_mut().page_mut(PageId::One)[16..24]
            .copy_from_slice(&0xAAAA_AAAA_AAAA_AAAA_u64.to_le_bytes());
        assert_eq!(ee.page_status(PageId::One), Ok(PageStatus::Full));

        ee.init().unwrap();

        assert_eq!(ee.page_status(PageId::One), Ok(PageStatus::Formatted));
        assert_eq!(ee.page_status(PageId::Two), Ok(PageStatus::Active));
        assert_eq!(read_string(&ee, 0x77, &mut buf), Ok(b"pinned".as_slice()));
    }
}
