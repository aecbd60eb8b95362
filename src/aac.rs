// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! AAC framing: ADTS (stream type 0x0F) header parsing and frame scanning,
//! `AudioSpecificConfig` construction, and a minimal LOAS/LATM (stream type
//! 0x11) `StreamMuxConfig` scanner.

use base::bail_t;
use base::bitstream::BitReader;

/// ISO/IEC 13818-7 table 35, indexed by `sampling_frequency_index`.
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

pub fn sample_rate_for_index(idx: u8) -> Option<u32> {
    SAMPLE_RATES.get(idx as usize).copied()
}

pub struct AdtsHeader {
    /// `audioObjectType - 1`, per the ADTS `profile` field.
    pub profile: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
    /// Total frame length in bytes, header included.
    pub frame_length: usize,
    /// 7 bytes (no CRC) or 9 (CRC present).
    pub header_len: usize,
}

pub fn parse_adts_header(data: &[u8]) -> Result<AdtsHeader, base::Error> {
    if data.len() < 7 {
        bail_t!(MalformedContainer, "ADTS header truncated");
    }
    if data[0] != 0xff || data[1] & 0xf0 != 0xf0 {
        bail_t!(MalformedContainer, "missing ADTS syncword");
    }
    let protection_absent = data[1] & 0x01 != 0;
    let profile = (data[2] >> 6) & 0x03;
    let sampling_frequency_index = (data[2] >> 2) & 0x0f;
    let channel_configuration = ((data[2] & 0x01) << 2) | ((data[3] >> 6) & 0x03);
    let frame_length =
        (((data[3] & 0x03) as usize) << 11) | ((data[4] as usize) << 3) | ((data[5] as usize) >> 5);
    let header_len = if protection_absent { 7 } else { 9 };
    if frame_length < header_len {
        bail_t!(MalformedContainer, "ADTS frame_length shorter than header");
    }
    Ok(AdtsHeader {
        profile,
        sampling_frequency_index,
        channel_configuration,
        frame_length,
        header_len,
    })
}

/// Scans a buffer (which may pack several back-to-back ADTS frames) and
/// calls `f` with each complete frame's raw payload, header stripped.
/// Returns whatever trailing bytes didn't form a complete frame, so the
/// caller can prepend them to the next PES's payload.
pub fn scan_adts_frames<'a, F: FnMut(&'a [u8], &AdtsHeader)>(
    mut data: &'a [u8],
    mut f: F,
) -> Result<&'a [u8], base::Error> {
    while data.len() >= 7 {
        let header = parse_adts_header(data)?;
        if header.frame_length > data.len() {
            break; // trailing partial frame; caller retains it
        }
        f(&data[header.header_len..header.frame_length], &header);
        data = &data[header.frame_length..];
    }
    Ok(data)
}

/// Builds a 2-byte `AudioSpecificConfig` (ISO/IEC 14496-3 §1.6.2.1) for the
/// common case of no SBR/PS extension and default `GASpecificConfig`.
pub fn audio_specific_config(object_type_minus_1: u8, sampling_frequency_index: u8, channel_configuration: u8) -> Vec<u8> {
    let audio_object_type = object_type_minus_1 + 1;
    let b0 = (audio_object_type << 3) | (sampling_frequency_index >> 1);
    let b1 = (sampling_frequency_index << 7) | (channel_configuration << 3);
    vec![b0, b1]
}

/// Minimal `StreamMuxConfig` read out of a LOAS (`0x56`-prefixed) AAC
/// payload: assumes `audioMuxVersion == 0`, `allStreamsSameTimeFraming ==
/// 1`, a single program/layer, matching what broadcast LATM encoders emit.
/// Returns `(sampling_frequency_index, channel_configuration)`.
pub fn parse_latm_stream_mux_config(payload: &[u8]) -> Result<(u8, u8), base::Error> {
    let mut r = BitReader::new(payload);
    let audio_mux_version = r.read_bits(1);
    if audio_mux_version != 0 {
        bail_t!(UnsupportedCodec, "LATM audioMuxVersion != 0 unsupported");
    }
    let all_streams_same_time_framing = r.read_bits(1);
    if all_streams_same_time_framing != 1 {
        bail_t!(
            UnsupportedCodec,
            "LATM streams without allStreamsSameTimeFraming unsupported"
        );
    }
    r.read_bits(6); // numSubFrames
    r.read_bits(4); // numProgram
    r.read_bits(3); // numLayer
    let audio_object_type_minus_1 = r.read_bits(5) as u8;
    let sampling_frequency_index = r.read_bits(4) as u8;
    let channel_configuration = r.read_bits(4) as u8;
    let _ = audio_object_type_minus_1;
    Ok((sampling_frequency_index, channel_configuration))
}

/// Scans a LOAS byte stream (`0x56`, 11-bit sync, 13-bit `frameLength`) for
/// `AudioMuxElement`s, handing each one's payload bytes to `f`.
pub fn scan_loas_frames<'a, F: FnMut(&'a [u8])>(mut data: &'a [u8], mut f: F) {
    while data.len() >= 3 {
        if data[0] != 0x56 || data[1] & 0xe0 != 0xe0 {
            break;
        }
        let frame_length = (((data[1] & 0x1f) as usize) << 8) | data[2] as usize;
        let total = 3 + frame_length;
        if total > data.len() {
            break;
        }
        f(&data[3..total]);
        data = &data[total..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_adts(profile: u8, sfi: u8, channels: u8, payload: &[u8]) -> Vec<u8> {
        let frame_length = 7 + payload.len();
        let mut out = vec![0u8; 7];
        out[0] = 0xff;
        out[1] = 0xf1; // MPEG-4, layer 0, protection_absent=1
        out[2] = (profile << 6) | (sfi << 2) | (channels >> 2);
        out[3] = ((channels & 0x03) << 6) | ((frame_length >> 11) as u8 & 0x03);
        out[4] = (frame_length >> 3) as u8;
        out[5] = (((frame_length & 0x07) as u8) << 5) | 0x1f;
        out[6] = 0xfc;
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_adts_header_fields() {
        let frame = make_adts(1, 3, 2, &[0xAA, 0xBB, 0xCC]);
        let header = parse_adts_header(&frame).unwrap();
        assert_eq!(header.profile, 1);
        assert_eq!(header.sampling_frequency_index, 3);
        assert_eq!(header.channel_configuration, 2);
        assert_eq!(header.frame_length, frame.len());
    }

    #[test]
    fn scans_two_back_to_back_frames() {
        let f1 = make_adts(1, 3, 2, &[0x01, 0x02]);
        let f2 = make_adts(1, 3, 2, &[0x03]);
        let mut combined = f1.clone();
        combined.extend_from_slice(&f2);
        let mut payloads = Vec::new();
        let remainder = scan_adts_frames(&combined, |p, _| payloads.push(p.to_vec())).unwrap();
        assert_eq!(payloads, vec![vec![0x01, 0x02], vec![0x03]]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn leaves_a_trailing_partial_frame_as_the_remainder() {
        let f1 = make_adts(1, 3, 2, &[0x01]);
        let mut combined = f1.clone();
        combined.extend_from_slice(&[0xff, 0xf1, 0x40]); // a truncated header, 3 bytes
        let mut payloads = Vec::new();
        let remainder = scan_adts_frames(&combined, |p, _| payloads.push(p.to_vec())).unwrap();
        assert_eq!(payloads, vec![vec![0x01]]);
        assert_eq!(remainder, &combined[f1.len()..]);
    }

    #[test]
    fn audio_specific_config_matches_known_encoding() {
        // AAC-LC (object type 2), 44100 Hz (index 4), stereo.
        let asc = audio_specific_config(1, 4, 2);
        assert_eq!(asc, vec![0x12, 0x10]);
    }

    #[test]
    fn sample_rate_table_covers_common_rates() {
        assert_eq!(sample_rate_for_index(3), Some(48000));
        assert_eq!(sample_rate_for_index(4), Some(44100));
    }
}
