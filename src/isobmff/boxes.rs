// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Typed decoders for the specific boxes the fMP4 assembler and the MP4
//! writer need, built on the generic walker in [`crate::isobmff`].

use crate::isobmff::{self, Boxes};
use crate::model::{AvcParameterSets, HevcParameterSets};
use base::bail_t;
use base::bitstream::{read_u16, read_u24, read_u32, read_u64};

fn version_flags(body: &[u8]) -> Result<(u8, u32), base::Error> {
    if body.len() < 4 {
        bail_t!(MalformedContainer, "full box header truncated");
    }
    Ok((body[0], read_u24(body, 1)))
}

pub struct Tkhd {
    pub track_id: u32,
}

pub fn parse_tkhd(body: &[u8]) -> Result<Tkhd, base::Error> {
    let (version, _flags) = version_flags(body)?;
    let off = if version == 1 { 4 + 8 + 8 } else { 4 + 4 + 4 };
    if body.len() < off + 4 {
        bail_t!(MalformedContainer, "tkhd truncated before track_ID");
    }
    Ok(Tkhd {
        track_id: read_u32(body, off),
    })
}

pub struct Mdhd {
    pub timescale: u32,
}

pub fn parse_mdhd(body: &[u8]) -> Result<Mdhd, base::Error> {
    let (version, _flags) = version_flags(body)?;
    let off = if version == 1 { 4 + 8 + 8 } else { 4 + 4 + 4 };
    if body.len() < off + 4 {
        bail_t!(MalformedContainer, "mdhd truncated before timescale");
    }
    Ok(Mdhd {
        timescale: read_u32(body, off),
    })
}

pub fn parse_hdlr_type(body: &[u8]) -> Result<[u8; 4], base::Error> {
    let (_version, _flags) = version_flags(body)?;
    if body.len() < 12 {
        bail_t!(MalformedContainer, "hdlr truncated before handler_type");
    }
    Ok([body[8], body[9], body[10], body[11]])
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TrexDefaults {
    pub track_id: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

pub fn parse_trex(body: &[u8]) -> Result<TrexDefaults, base::Error> {
    let (_version, _flags) = version_flags(body)?;
    if body.len() < 4 + 16 {
        bail_t!(MalformedContainer, "trex truncated");
    }
    Ok(TrexDefaults {
        track_id: read_u32(body, 4),
        default_sample_duration: read_u32(body, 12),
        default_sample_size: read_u32(body, 16),
        default_sample_flags: read_u32(body, 20),
    })
}

pub enum SampleEntry {
    Avc {
        width: u16,
        height: u16,
        parameter_sets: AvcParameterSets,
    },
    Hevc {
        width: u16,
        height: u16,
        parameter_sets: HevcParameterSets,
    },
    Aac {
        channels: u8,
        audio_specific_config: Vec<u8>,
    },
}

/// Decodes the first entry of an `stsd` box body.
pub fn parse_stsd_first_entry(body: &[u8]) -> Result<SampleEntry, base::Error> {
    if body.len() < 8 {
        bail_t!(MalformedContainer, "stsd truncated before entry_count");
    }
    let entry_count = read_u32(body, 4);
    if entry_count == 0 {
        bail_t!(MalformedContainer, "stsd has no sample entries");
    }
    let mut boxes = Boxes::new(&body[8..]);
    let entry = boxes
        .next()
        .ok_or_else(|| base::format_err_t!(MalformedContainer, "stsd entry_count lied"))??;

    if isobmff::is_type(entry.box_type, b"avc1") || isobmff::is_type(entry.box_type, b"avc3") {
        let (width, height) = parse_visual_sample_entry_dims(entry.body)?;
        let avcc = isobmff::require(&entry.body[78..], b"avcC")?;
        let parameter_sets = parse_avcc(avcc)?;
        Ok(SampleEntry::Avc {
            width,
            height,
            parameter_sets,
        })
    } else if isobmff::is_type(entry.box_type, b"hvc1") || isobmff::is_type(entry.box_type, b"hev1") {
        let (width, height) = parse_visual_sample_entry_dims(entry.body)?;
        let hvcc = isobmff::require(&entry.body[78..], b"hvcC")?;
        let parameter_sets = parse_hvcc(hvcc)?;
        Ok(SampleEntry::Hevc {
            width,
            height,
            parameter_sets,
        })
    } else if isobmff::is_type(entry.box_type, b"mp4a") {
        if entry.body.len() < 28 {
            bail_t!(MalformedContainer, "mp4a sample entry truncated");
        }
        let channels = read_u16(entry.body, 8) as u8;
        let esds = isobmff::require(&entry.body[28..], b"esds")?;
        let audio_specific_config = parse_esds_decoder_specific_info(esds)?;
        Ok(SampleEntry::Aac {
            channels,
            audio_specific_config,
        })
    } else {
        bail_t!(
            UnsupportedCodec,
            "unsupported sample entry box type {:#010x}",
            entry.box_type
        );
    }
}

fn parse_visual_sample_entry_dims(body: &[u8]) -> Result<(u16, u16), base::Error> {
    if body.len() < 78 {
        bail_t!(MalformedContainer, "visual sample entry truncated");
    }
    Ok((read_u16(body, 24), read_u16(body, 26)))
}

fn parse_avcc(body: &[u8]) -> Result<AvcParameterSets, base::Error> {
    if body.len() < 7 {
        bail_t!(MalformedContainer, "avcC truncated");
    }
    let num_sps = body[5] & 0x1f;
    if num_sps == 0 {
        bail_t!(MalformedContainer, "avcC has no SPS");
    }
    let sps_len = read_u16(body, 6) as usize;
    let sps_start = 8;
    if body.len() < sps_start + sps_len + 3 {
        bail_t!(MalformedContainer, "avcC truncated within SPS/PPS");
    }
    let sps = body[sps_start..sps_start + sps_len].to_vec();
    let after_sps = sps_start + sps_len;
    let pps_len = read_u16(body, after_sps + 1) as usize;
    let pps_start = after_sps + 3;
    if body.len() < pps_start + pps_len {
        bail_t!(MalformedContainer, "avcC truncated within PPS");
    }
    let pps = body[pps_start..pps_start + pps_len].to_vec();
    Ok(AvcParameterSets { sps, pps })
}

fn parse_hvcc(body: &[u8]) -> Result<HevcParameterSets, base::Error> {
    if body.len() < 23 {
        bail_t!(MalformedContainer, "hvcC truncated");
    }
    let num_arrays = body[22];
    let mut off = 23;
    let (mut vps, mut sps, mut pps) = (None, None, None);
    for _ in 0..num_arrays {
        if body.len() < off + 3 {
            bail_t!(MalformedContainer, "hvcC array header truncated");
        }
        let nal_type = body[off] & 0x3f;
        let num_nalus = read_u16(body, off + 1) as usize;
        off += 3;
        for _ in 0..num_nalus {
            if body.len() < off + 2 {
                bail_t!(MalformedContainer, "hvcC nalu length truncated");
            }
            let len = read_u16(body, off) as usize;
            off += 2;
            if body.len() < off + len {
                bail_t!(MalformedContainer, "hvcC nalu body truncated");
            }
            let nal = body[off..off + len].to_vec();
            off += len;
            match nal_type {
                32 if vps.is_none() => vps = Some(nal),
                33 if sps.is_none() => sps = Some(nal),
                34 if pps.is_none() => pps = Some(nal),
                _ => {}
            }
        }
    }
    Ok(HevcParameterSets {
        vps: vps.ok_or_else(|| base::format_err_t!(MalformedContainer, "hvcC has no VPS"))?,
        sps: sps.ok_or_else(|| base::format_err_t!(MalformedContainer, "hvcC has no SPS"))?,
        pps: pps.ok_or_else(|| base::format_err_t!(MalformedContainer, "hvcC has no PPS"))?,
    })
}

/// Walks MPEG-4 descriptor tags (ISO/IEC 14496-1 §7.2.2), each a 1-byte tag
/// followed by a variable-length-encoded size, recursing into container
/// descriptors (`ES_Descriptor` tag 3, `DecoderConfigDescriptor` tag 4) to
/// find tag 5, `DecSpecificInfo` — the raw `AudioSpecificConfig`.
fn walk_descriptors(body: &[u8]) -> Result<Vec<u8>, base::Error> {
    let mut pos = 0;
    while pos < body.len() {
        let tag = body[pos];
        pos += 1;
        let mut len = 0usize;
        let mut more = true;
        while more && pos < body.len() {
            let b = body[pos];
            pos += 1;
            len = (len << 7) | (b & 0x7f) as usize;
            more = b & 0x80 != 0;
        }
        if pos + len > body.len() {
            bail_t!(MalformedContainer, "esds descriptor length overruns box");
        }
        let descriptor = &body[pos..pos + len];
        pos += len;
        match tag {
            0x03 => {
                // ES_Descriptor: ES_ID(2) + flags(1), then nested descriptors.
                if descriptor.len() > 3 {
                    if let Ok(found) = walk_descriptors(&descriptor[3..]) {
                        return Ok(found);
                    }
                }
            }
            0x04 => {
                // DecoderConfigDescriptor: objectTypeIndication(1) + flags(1)
                // + bufferSizeDB(3) + maxBitrate(4) + avgBitrate(4) = 13
                // bytes, then a nested DecSpecificInfo.
                if descriptor.len() > 13 {
                    if let Ok(found) = walk_descriptors(&descriptor[13..]) {
                        return Ok(found);
                    }
                }
            }
            0x05 => return Ok(descriptor.to_vec()),
            _ => {}
        }
    }
    bail_t!(MalformedContainer, "esds has no DecSpecificInfo");
}

fn parse_esds_decoder_specific_info(body: &[u8]) -> Result<Vec<u8>, base::Error> {
    let (_version, _flags) = version_flags(body)?;
    walk_descriptors(&body[4..])
}

#[derive(Copy, Clone, Default)]
pub struct Tfhd {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub default_base_is_moof: bool,
}

pub fn parse_tfhd(body: &[u8]) -> Result<Tfhd, base::Error> {
    let (_version, flags) = version_flags(body)?;
    if body.len() < 8 {
        bail_t!(MalformedContainer, "tfhd truncated before track_ID");
    }
    let track_id = read_u32(body, 4);
    let mut off = 8;
    let mut tfhd = Tfhd {
        track_id,
        default_base_is_moof: flags & 0x02_0000 != 0,
        ..Default::default()
    };
    if flags & 0x01 != 0 {
        tfhd.base_data_offset = Some(read_u64(body, off));
        off += 8;
    }
    if flags & 0x02 != 0 {
        off += 4; // sample_description_index, unused
    }
    if flags & 0x08 != 0 {
        tfhd.default_sample_duration = Some(read_u32(body, off));
        off += 4;
    }
    if flags & 0x10 != 0 {
        tfhd.default_sample_size = Some(read_u32(body, off));
        off += 4;
    }
    if flags & 0x20 != 0 {
        tfhd.default_sample_flags = Some(read_u32(body, off));
    }
    Ok(tfhd)
}

pub fn parse_tfdt(body: &[u8]) -> Result<u64, base::Error> {
    let (version, _flags) = version_flags(body)?;
    if version == 1 {
        if body.len() < 12 {
            bail_t!(MalformedContainer, "tfdt (v1) truncated");
        }
        Ok(read_u64(body, 4))
    } else {
        if body.len() < 8 {
            bail_t!(MalformedContainer, "tfdt (v0) truncated");
        }
        Ok(read_u32(body, 4) as u64)
    }
}

#[derive(Copy, Clone, Default)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub composition_time_offset: Option<i32>,
}

pub struct Trun {
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

pub fn parse_trun(body: &[u8]) -> Result<Trun, base::Error> {
    let (_version, flags) = version_flags(body)?;
    if body.len() < 8 {
        bail_t!(MalformedContainer, "trun truncated before sample_count");
    }
    let sample_count = read_u32(body, 4) as usize;
    let mut off = 8;
    let data_offset = if flags & 0x01 != 0 {
        let v = read_u32(body, off) as i32;
        off += 4;
        Some(v)
    } else {
        None
    };
    let first_sample_flags = if flags & 0x04 != 0 {
        let v = read_u32(body, off);
        off += 4;
        Some(v)
    } else {
        None
    };

    let has_duration = flags & 0x100 != 0;
    let has_size = flags & 0x200 != 0;
    let has_flags = flags & 0x400 != 0;
    let has_cts = flags & 0x800 != 0;
    let mut samples = Vec::with_capacity(sample_count);
    for _ in 0..sample_count {
        let mut sample = TrunSample::default();
        if has_duration {
            sample.duration = Some(read_u32(body, off));
            off += 4;
        }
        if has_size {
            sample.size = Some(read_u32(body, off));
            off += 4;
        }
        if has_flags {
            sample.flags = Some(read_u32(body, off));
            off += 4;
        }
        if has_cts {
            // Unsigned in v0, signed in v1; both decode identically as the
            // raw bit pattern reinterpreted as i32.
            sample.composition_time_offset = Some(read_u32(body, off) as i32);
            off += 4;
        }
        samples.push(sample);
    }
    Ok(Trun {
        data_offset,
        first_sample_flags,
        samples,
    })
}
