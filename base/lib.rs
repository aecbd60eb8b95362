// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Leaf utilities shared by every other module: the error taxonomy and the
//! bit-level/byte-level readers the demuxer, box reader, and writer all sit
//! on top of. Nothing in this crate depends on the rest of `clipmux`.

pub mod bitstream;
mod error;

pub use crate::error::{Error, ErrorKind, ResultExt};
