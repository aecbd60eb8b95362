// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Sniffs whether a buffer is an MPEG-2 Transport Stream or fragmented
//! ISO-BMFF, so the public entry points can dispatch without the caller
//! having to say which.

use base::bail_t;
use base::bitstream::{fourcc, read_u32};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Ts,
    FragmentedMp4,
}

const TS_SYNC_BYTE: u8 = 0x47;
const TS_PACKET_LEN: usize = 188;

pub fn detect(data: &[u8]) -> Result<Format, base::Error> {
    // A lone sync byte is enough when the buffer can't hold a second packet
    // to confirm against (mirrors ts::packet::find_first_sync's leniency for
    // a single-packet capture).
    if data.len() >= TS_PACKET_LEN
        && data[0] == TS_SYNC_BYTE
        && (data.len() < 2 * TS_PACKET_LEN || data[TS_PACKET_LEN] == TS_SYNC_BYTE)
    {
        return Ok(Format::Ts);
    }
    if data.len() >= 8 {
        let box_type = read_u32(data, 4);
        if [b"ftyp", b"styp", b"moov", b"moof"]
            .iter()
            .any(|fcc| box_type == fourcc(fcc))
        {
            return Ok(Format::FragmentedMp4);
        }
    }
    bail_t!(
        MalformedContainer,
        "input is neither a transport stream nor ISO-BMFF"
    );
}
