// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Program Association Table and Program Map Table parsing: just enough
//! PSI to find the video and audio elementary PIDs for the first program.

use base::bail_t;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamType {
    Avc,
    Hevc,
    AdtsAac,
    LatmAac,
    /// A PMT stream_type this crate explicitly knows it cannot remux,
    /// carrying a human-readable codec name and whether it's a video or
    /// audio stream.
    Unsupported {
        name: &'static str,
        is_video: bool,
    },
    /// Anything else: private data, subtitles, PCR-only streams. Not every
    /// PMT entry is media this crate needs an opinion on.
    Other(u8),
}

impl From<u8> for StreamType {
    fn from(v: u8) -> Self {
        match v {
            0x1B => StreamType::Avc,
            0x24 => StreamType::Hevc,
            0x0F => StreamType::AdtsAac,
            0x11 => StreamType::LatmAac,
            0x01 => StreamType::Unsupported { name: "MPEG-1 video", is_video: true },
            0x02 => StreamType::Unsupported { name: "MPEG-2 video", is_video: true },
            0x03 => StreamType::Unsupported { name: "MPEG-1 audio (MP3)", is_video: false },
            0x04 => StreamType::Unsupported { name: "MPEG-2 audio (MP3)", is_video: false },
            0x81 => StreamType::Unsupported { name: "AC-3", is_video: false },
            0x87 => StreamType::Unsupported { name: "E-AC-3", is_video: false },
            other => StreamType::Other(other),
        }
    }
}

impl StreamType {
    pub fn is_video(&self) -> bool {
        matches!(self, StreamType::Avc | StreamType::Hevc)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, StreamType::AdtsAac | StreamType::LatmAac)
    }
}

/// Reassembles a PSI section (PAT or PMT) out of TS packet payloads for a
/// given PID: the first payload carries a `pointer_field` byte; `table_id`
/// plus the 12-bit `section_length` then bound the rest.
pub struct SectionAssembler {
    buf: Vec<u8>,
    expected_len: Option<usize>,
}

impl SectionAssembler {
    pub fn new() -> Self {
        SectionAssembler {
            buf: Vec::new(),
            expected_len: None,
        }
    }

    /// Feeds one packet's payload. `pusi` marks the packet that starts a new
    /// section (and thus carries a leading `pointer_field`). Returns the
    /// complete section once enough bytes have arrived.
    pub fn feed(&mut self, payload: &[u8], pusi: bool) -> Option<Vec<u8>> {
        if pusi {
            if payload.is_empty() {
                return None;
            }
            let pointer = payload[0] as usize;
            let start = 1 + pointer;
            if start > payload.len() {
                return None;
            }
            self.buf.clear();
            self.buf.extend_from_slice(&payload[start..]);
            self.expected_len = None;
        } else if self.expected_len.is_none() && self.buf.is_empty() {
            return None;
        } else {
            self.buf.extend_from_slice(payload);
        }

        if self.expected_len.is_none() && self.buf.len() >= 3 {
            let section_length = (((self.buf[1] & 0x0f) as usize) << 8) | self.buf[2] as usize;
            self.expected_len = Some(3 + section_length);
        }
        if let Some(len) = self.expected_len {
            if self.buf.len() >= len {
                let section = self.buf[..len].to_vec();
                self.buf.clear();
                self.expected_len = None;
                return Some(section);
            }
        }
        None
    }
}

/// Parses a PAT section and returns the PID of the first program's PMT.
pub fn parse_pat(data: &[u8]) -> Result<u16, base::Error> {
    if data.len() < 8 || data[0] != 0x00 {
        bail_t!(MalformedContainer, "not a PAT section");
    }
    let section_length = (((data[1] & 0x0f) as usize) << 8) | data[2] as usize;
    let end = (3 + section_length).saturating_sub(4).min(data.len());
    let mut off = 8;
    while off + 4 <= end {
        let program_number = ((data[off] as u16) << 8) | data[off + 1] as u16;
        let pid = (((data[off + 2] & 0x1f) as u16) << 8) | data[off + 3] as u16;
        off += 4;
        if program_number != 0 {
            return Ok(pid);
        }
    }
    bail_t!(MalformedContainer, "PAT contains no programs");
}

pub struct PmtStream {
    pub stream_type: StreamType,
    pub pid: u16,
}

pub struct Pmt {
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    pub fn parse(data: &[u8]) -> Result<Self, base::Error> {
        if data.len() < 12 || data[0] != 0x02 {
            bail_t!(MalformedContainer, "not a PMT section");
        }
        let section_length = (((data[1] & 0x0f) as usize) << 8) | data[2] as usize;
        let streams_end = (3 + section_length).saturating_sub(4).min(data.len());
        let program_info_length = (((data[10] & 0x0f) as usize) << 8) | data[11] as usize;
        let mut off = 12 + program_info_length;

        let mut streams = Vec::new();
        while off + 5 <= streams_end {
            let stream_type = StreamType::from(data[off]);
            let pid = (((data[off + 1] & 0x1f) as u16) << 8) | data[off + 2] as u16;
            let es_info_length = (((data[off + 3] & 0x0f) as usize) << 8) | data[off + 4] as usize;
            off += 5 + es_info_length;
            streams.push(PmtStream { stream_type, pid });
        }
        if off > streams_end {
            bail_t!(MalformedContainer, "PMT stream loop overruns section");
        }
        Ok(Pmt { streams })
    }

    pub fn video_stream(&self) -> Option<&PmtStream> {
        self.streams.iter().find(|s| s.stream_type.is_video())
    }

    pub fn audio_stream(&self) -> Option<&PmtStream> {
        self.streams.iter().find(|s| s.stream_type.is_audio())
    }

    /// Fails the conversion if the PMT names a codec this crate explicitly
    /// refuses to remux (MPEG-1/2 video, MP3, AC-3, E-AC-3). A PMT may
    /// carry other stream types this crate simply ignores (private data,
    /// subtitles); those are not an error.
    pub fn reject_unsupported(&self) -> Result<(), base::Error> {
        for s in &self.streams {
            if let StreamType::Unsupported { name, is_video } = s.stream_type {
                bail_t!(
                    UnsupportedCodec,
                    "{} stream uses unsupported codec {}",
                    if is_video { "video" } else { "audio" },
                    name
                );
            }
        }
        Ok(())
    }
}
