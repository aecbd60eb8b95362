// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! PES (Packetized Elementary Stream) reassembly and header decode.
//!
//! Video elementary streams routinely set `PES_packet_length` to 0 ("unbounded
//! length"), so packet boundaries can't be derived from the header; this
//! crate instead treats the next `payload_unit_start`-flagged TS packet on
//! the same PID as the end of the previous PES packet, same as every other
//! software TS demuxer.

use base::bail_t;
use base::bitstream::read_pts;

pub struct PesPacket {
    /// `None` when the PES header carries no PTS at all. Video drops such
    /// PES packets outright (they can't be placed on a timeline); audio
    /// instead carries the running timestamp forward — see
    /// `crate::ts::audio`.
    pub pts: Option<i64>,
    /// Equal to `pts` when the stream carries no separate DTS (true for
    /// audio, and for video GOPs without B-frames).
    pub dts: Option<i64>,
    pub payload: Vec<u8>,
}

/// Accumulates raw PES bytes across TS packets for one PID.
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    have_unit: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler::default()
    }

    /// Feeds one TS packet's payload. Returns the previous PES packet's raw
    /// bytes once a new one begins.
    pub fn feed(&mut self, payload: &[u8], pusi: bool) -> Option<Vec<u8>> {
        let mut finished = None;
        if pusi {
            if self.have_unit {
                finished = Some(std::mem::take(&mut self.buf));
            }
            self.have_unit = true;
        } else if !self.have_unit {
            return None;
        }
        self.buf.extend_from_slice(payload);
        finished
    }

    /// Call once input is exhausted to flush the final accumulated packet.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.have_unit && !self.buf.is_empty() {
            self.have_unit = false;
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }
}

/// Decodes a complete raw PES packet's header and returns it alongside its
/// payload (the coded video/audio bytes with all PES framing stripped).
pub fn decode(raw: &[u8]) -> Result<PesPacket, base::Error> {
    if raw.len() < 9 || raw[0] != 0x00 || raw[1] != 0x00 || raw[2] != 0x01 {
        bail_t!(MalformedContainer, "missing PES start code prefix");
    }
    let pts_dts_flags = (raw[7] >> 6) & 0x3;
    let header_data_length = raw[8] as usize;
    let optional_start = 9;
    let payload_start = optional_start + header_data_length;
    if payload_start > raw.len() {
        bail_t!(MalformedContainer, "PES header_data_length overruns packet");
    }

    let (pts, dts) = match pts_dts_flags {
        0b10 => {
            if header_data_length < 5 {
                bail_t!(MalformedContainer, "PES PTS flag set without room for PTS");
            }
            let pts = read_pts(&raw[optional_start..optional_start + 5]) as i64;
            (Some(pts), Some(pts))
        }
        0b11 => {
            if header_data_length < 10 {
                bail_t!(
                    MalformedContainer,
                    "PES PTS/DTS flags set without room for both"
                );
            }
            let pts = read_pts(&raw[optional_start..optional_start + 5]) as i64;
            let dts = read_pts(&raw[optional_start + 5..optional_start + 10]) as i64;
            (Some(pts), Some(dts))
        }
        // 0b00: no PTS/DTS at all. 0b01 is reserved by the spec but some
        // encoders emit it meaning the same as 0b00; either way there's no
        // timestamp to read out of the optional header fields.
        _ => (None, None),
    };

    Ok(PesPacket {
        pts,
        dts,
        payload: raw[payload_start..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pes_with_pts_dts(pts: u64, dts: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0xC0, 0x0A];
        out.push(0x21 | (((pts >> 30) & 0x07) as u8) << 1);
        out.push((pts >> 22) as u8);
        out.push(0x01 | (((pts >> 15) & 0x7f) as u8) << 1);
        out.push((pts >> 7) as u8);
        out.push(0x01 | ((pts & 0x7f) as u8) << 1);
        out.push(0x11 | (((dts >> 30) & 0x07) as u8) << 1);
        out.push((dts >> 22) as u8);
        out.push(0x01 | (((dts >> 15) & 0x7f) as u8) << 1);
        out.push((dts >> 7) as u8);
        out.push(0x01 | ((dts & 0x7f) as u8) << 1);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_pts_and_dts() {
        let raw = pes_with_pts_dts(180_000, 170_000, &[0xDE, 0xAD]);
        let pkt = decode(&raw).unwrap();
        assert_eq!(pkt.pts, Some(180_000));
        assert_eq!(pkt.dts, Some(170_000));
        assert_eq!(pkt.payload, vec![0xDE, 0xAD]);
    }

    #[test]
    fn reassembler_splits_on_payload_unit_start() {
        let mut r = Reassembler::new();
        assert!(r.feed(&[1, 2, 3], true).is_none());
        assert!(r.feed(&[4, 5], false).is_none());
        let first = r.feed(&[6, 7], true).unwrap();
        assert_eq!(first, vec![1, 2, 3, 4, 5]);
        let last = r.finish().unwrap();
        assert_eq!(last, vec![6, 7]);
    }
}
