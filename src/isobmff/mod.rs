// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! A generic ISO-BMFF box reader: nothing here knows what a `moov` or a
//! `trun` means, it just walks the `size`/`type`/`body` framing every box
//! shares (ISO/IEC 14496-12 §4.2). Typed decoders live in [`crate::isobmff::boxes`].

pub mod boxes;

use base::bail_t;
use base::bitstream::{fourcc, read_u32, read_u64};

#[derive(Copy, Clone)]
pub struct BoxHeader<'a> {
    pub box_type: u32,
    pub body: &'a [u8],
    /// Offset of this box's first byte (the `size` field) within the slice
    /// originally passed to [`Boxes::new`]. Only meaningful when that slice
    /// is itself an absolute file offset, i.e. when walking top-level boxes.
    pub start: usize,
}

/// Iterates the sibling boxes packed into `data`, in file order.
pub struct Boxes<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Boxes<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Boxes { data, pos: 0 }
    }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = Result<BoxHeader<'a>, base::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.data.len() {
            return None;
        }
        let box_start = self.pos;
        Some((|| {
            let remaining = &self.data[self.pos..];
            if remaining.len() < 8 {
                bail_t!(MalformedContainer, "box header truncated");
            }
            let small_size = read_u32(remaining, 0) as u64;
            let box_type = read_u32(remaining, 4);
            let (header_len, size) = if small_size == 1 {
                if remaining.len() < 16 {
                    bail_t!(MalformedContainer, "largesize box header truncated");
                }
                (16usize, read_u64(remaining, 8))
            } else if small_size == 0 {
                (8, remaining.len() as u64)
            } else {
                (8, small_size)
            };
            let size = size as usize;
            if size < header_len || size > remaining.len() {
                bail_t!(
                    MalformedContainer,
                    "box size {} out of range (header {}, remaining {})",
                    size,
                    header_len,
                    remaining.len()
                );
            }
            self.pos += size;
            Ok(BoxHeader {
                box_type,
                body: &remaining[header_len..size],
                start: box_start,
            })
        })())
    }
}

pub fn is_type(box_type: u32, fcc: &[u8; 4]) -> bool {
    box_type == fourcc(fcc)
}

/// Finds the first immediate child box of type `fcc`.
pub fn find<'a>(data: &'a [u8], fcc: &[u8; 4]) -> Result<Option<&'a [u8]>, base::Error> {
    for b in Boxes::new(data) {
        let b = b?;
        if is_type(b.box_type, fcc) {
            return Ok(Some(b.body));
        }
    }
    Ok(None)
}

/// Like [`find`], but an absent box is an error.
pub fn require<'a>(data: &'a [u8], fcc: &[u8; 4]) -> Result<&'a [u8], base::Error> {
    find(data, fcc)?.ok_or_else(|| {
        base::format_err_t!(
            MalformedContainer,
            "missing required box {:?}",
            std::str::from_utf8(fcc).unwrap_or("????")
        )
    })
}

/// Collects every immediate child box of type `fcc`, in order.
pub fn find_all<'a>(data: &'a [u8], fcc: &[u8; 4]) -> Result<Vec<&'a [u8]>, base::Error> {
    let mut out = Vec::new();
    for b in Boxes::new(data) {
        let b = b?;
        if is_type(b.box_type, fcc) {
            out.push(b.body);
        }
    }
    Ok(out)
}
