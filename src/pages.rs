// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page selection and transfer bookkeeping shared by both record modes.

use crate::flash::{self, Flash, PageId};
use crate::header::{HeaderEncoding, PageStatus};

/// Finds the page lookups should run against: the ACTIVE one.
pub(crate) fn find_read_page<F: Flash>(
    flash: &F,
    encoding: HeaderEncoding,
) -> Result<Option<PageId>, F::Error> {
    for page in PageId::DATA {
        if encoding.read_status(flash, page)? == PageStatus::Active {
            return Ok(Some(page));
        }
    }
    Ok(None)
}

/// Finds the page appends should land on.
///
/// Normally the ACTIVE page; while a transfer is filling the other page,
/// the RECEIVE side is the write target instead.
pub(crate) fn find_write_page<F: Flash>(
    flash: &F,
    encoding: HeaderEncoding,
) -> Result<Option<PageId>, F::Error> {
    let p1 = encoding.read_status(flash, PageId::One)?;
    let p2 = encoding.read_status(flash, PageId::Two)?;

    Ok(if p2 == PageStatus::Active {
        Some(if p1 == PageStatus::Receive {
            PageId::One
        } else {
            PageId::Two
        })
    } else if p1 == PageStatus::Active {
        Some(if p2 == PageStatus::Receive {
            PageId::Two
        } else {
            PageId::One
        })
    } else {
        None
    })
}

/// Settles page statuses once every live record has reached `to`.
///
/// The latched order activates the destination before touching the source,
/// so that losing power mid-erase still leaves one readable ACTIVE page. The
/// simple encoding keeps the original order, where the source is recycled
/// first and the destination promoted as the final word write.
pub(crate) fn finalize_transfer<F: Flash>(
    flash: &mut F,
    encoding: HeaderEncoding,
    from: PageId,
    to: PageId,
) -> Result<(), F::Error> {
    match encoding {
        HeaderEncoding::Simple => {
            flash.erase_page(from)?;
            encoding.mark(flash, from, PageStatus::Formatted)?;
            encoding.mark(flash, to, PageStatus::Active)?;
        }
        HeaderEncoding::Latched => {
            encoding.mark(flash, from, PageStatus::Full)?;
            encoding.mark(flash, to, PageStatus::Active)?;
            flash.erase_page(from)?;
            encoding.mark(flash, from, PageStatus::Formatted)?;
        }
    }
    Ok(())
}

/// Copies the factory image onto Page 1, word by word, stopping at the
/// first never-programmed word. The image carries its own header, so the
/// copy reproduces the factory page's status along with its records.
pub(crate) fn copy_factory_image<F: Flash>(flash: &mut F) -> Result<(), F::Error> {
    let mut offset = 0;
    while offset + 4 <= F::PAGE_SIZE {
        let word = flash::read_u32(flash, PageId::Factory, offset)?;
        if word == 0xFFFF_FFFF {
            break;
        }
        flash::write_u32(flash, PageId::One, offset, word)?;
        offset += 4;
    }
    Ok(())
}
