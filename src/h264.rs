// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! H.264 (AVC) NAL unit classification, `AVCDecoderConfigurationRecord`
//! construction, and Annex B -> length-prefixed sample transform.
//!
//! ISO/IEC 14496-10 has two byte stream encodings: Annex B (start codes,
//! used inside a Transport Stream) and ISO/IEC 14496-15 AVC access units
//! (4-byte big-endian lengths, used inside `mdat`). TS input arrives in the
//! former; every sample this crate writes is in the latter.

use crate::model::{AvcParameterSets, VideoSample};
use base::bail_t;
use base::bitstream::{scan_nal_units, write_u32, BitReader};

pub const NAL_UNIT_SEQ_PARAMETER_SET: u8 = 7;
pub const NAL_UNIT_PIC_PARAMETER_SET: u8 = 8;
pub const NAL_UNIT_IDR_SLICE: u8 = 5;
pub const NAL_UNIT_NON_IDR_SLICE: u8 = 1;

const NAL_UNIT_TYPE_MASK: u8 = 0x1F;

pub fn nal_unit_type(nal: &[u8]) -> u8 {
    nal[0] & NAL_UNIT_TYPE_MASK
}

/// An access unit is a keyframe if any of its slice NALs is an IDR slice.
pub fn is_keyframe(nals: &[&[u8]]) -> bool {
    nals.iter().any(|n| nal_unit_type(n) == NAL_UNIT_IDR_SLICE)
}

/// Converts one Annex B access unit into an ISO/IEC 14496-15 sample: each
/// NAL unit prefixed with its 4-byte big-endian length, matching
/// `lengthSizeMinusOne = 3` in the `avcC` this module writes.
pub fn annex_b_au_to_sample(data: &[u8], pts: i64, dts: i64) -> Result<VideoSample, base::Error> {
    let mut nals = Vec::new();
    scan_nal_units(data, |n| nals.push(n));
    if nals.is_empty() {
        bail_t!(MalformedContainer, "access unit contains no NAL units");
    }
    let is_keyframe = is_keyframe(&nals);
    let mut out = Vec::with_capacity(data.len() + 4 * nals.len());
    for nal in &nals {
        write_u32(&mut out, nal.len() as u32);
        out.extend_from_slice(nal);
    }
    Ok(VideoSample {
        data: out,
        pts,
        dts,
        is_keyframe,
    })
}

/// Builds the `AVCDecoderConfigurationRecord` body (ISO/IEC 14496-15 §5.2.4.1),
/// without its containing `avcC` box header. Supports exactly one SPS and one
/// PPS, which is what every TS/fMP4 source this crate has seen carries.
pub fn avc_decoder_config_record(params: &AvcParameterSets) -> Vec<u8> {
    let sps = &params.sps;
    let pps = &params.pps;
    let mut out = Vec::new();
    out.push(1); // configurationVersion
    out.push(sps[1]); // AVCProfileIndication
    out.push(sps[2]); // profile_compatibility
    out.push(sps[3]); // AVCLevelIndication
    out.push(0xff); // reserved(6) + lengthSizeMinusOne(2) = 3
    out.push(0xe1); // reserved(3) + numOfSequenceParameterSets(5) = 1
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1); // numOfPictureParameterSets
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    out
}

/// The RFC 6381 codec string, e.g. `avc1.640028`.
pub fn rfc6381_codec(params: &AvcParameterSets) -> String {
    format!(
        "avc1.{:02x}{:02x}{:02x}",
        params.sps[1], params.sps[2], params.sps[3]
    )
}

/// Parses `pic_width`/`pic_height` out of a raw (non-emulation-stripped) SPS
/// NAL, per ISO/IEC 14496-10 §7.3.2.1.1. Handles the scaling-list and
/// cropping syntax present in High Profile streams.
pub fn parse_sps_dimensions(sps: &[u8]) -> Result<(u16, u16), base::Error> {
    if sps.len() < 4 {
        bail_t!(MalformedContainer, "SPS too short");
    }
    let profile_idc = sps[1];
    let mut r = BitReader::new(&sps[3..]); // skip profile_idc/constraints/level_idc
    let _sps_id = r.read_ue();

    let mut chroma_format_idc = 1u32;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue();
        if chroma_format_idc == 3 {
            r.read_bits(1); // separate_colour_plane_flag
        }
        r.read_ue(); // bit_depth_luma_minus8
        r.read_ue(); // bit_depth_chroma_minus8
        r.read_bits(1); // qpprime_y_zero_transform_bypass_flag
        let scaling_matrix_present = r.read_bits(1) != 0;
        if scaling_matrix_present {
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                let present = r.read_bits(1) != 0;
                if present {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 });
                }
            }
        }
    }

    r.read_ue(); // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue();
    if pic_order_cnt_type == 0 {
        r.read_ue(); // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bits(1); // delta_pic_order_always_zero_flag
        r.read_se(); // offset_for_non_ref_pic
        r.read_se(); // offset_for_top_to_bottom_field
        let num_ref = r.read_ue();
        for _ in 0..num_ref {
            r.read_se();
        }
    }
    r.read_ue(); // max_num_ref_frames
    r.read_bits(1); // gaps_in_frame_num_value_allowed_flag
    let pic_width_in_mbs_minus1 = r.read_ue();
    let pic_height_in_map_units_minus1 = r.read_ue();
    let frame_mbs_only_flag = r.read_bits(1);
    if frame_mbs_only_flag == 0 {
        r.read_bits(1); // mb_adaptive_frame_field_flag
    }
    r.read_bits(1); // direct_8x8_inference_flag
    let frame_cropping_flag = r.read_bits(1) != 0;
    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0u32, 0u32, 0u32, 0u32);
    if frame_cropping_flag {
        crop_left = r.read_ue();
        crop_right = r.read_ue();
        crop_top = r.read_ue();
        crop_bottom = r.read_ue();
    }

    let (sub_width_c, sub_height_c) = match chroma_format_idc {
        1 => (2u32, 2u32),
        2 => (2, 1),
        3 => (1, 1),
        _ => (1, 1),
    };
    let frame_mbs_only = frame_mbs_only_flag != 0;
    let width = (pic_width_in_mbs_minus1 + 1) * 16 - sub_width_c * (crop_left + crop_right);
    let height_scale = if frame_mbs_only { 1 } else { 2 };
    let crop_unit_y = if frame_mbs_only {
        sub_height_c
    } else {
        sub_height_c * 2
    };
    let height = height_scale * (pic_height_in_map_units_minus1 + 1) * 16
        - crop_unit_y * (crop_top + crop_bottom);

    Ok((width as u16, height as u16))
}

fn skip_scaling_list(r: &mut BitReader, size: u32) {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se();
            next_scale = (last_scale + delta + 256) % 256;
        }
        last_scale = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A real baseline-profile SPS/PPS pair (1280x720), captured from a TS
    // muxer's avcC. profile_idc=66 (baseline) so the scaling-list branch is
    // not exercised here; see the note on Open Questions in DESIGN.md.
    const SPS: &[u8] = &[
        0x67, 0x42, 0x00, 0x1f, 0x8d, 0x8d, 0x40, 0x50, 0x1e, 0xd0, 0x0f, 0x08, 0x84, 0x6a,
    ];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

    fn params() -> AvcParameterSets {
        AvcParameterSets {
            sps: SPS.to_vec(),
            pps: PPS.to_vec(),
        }
    }

    #[test]
    fn codec_string_matches_sps_bytes() {
        assert_eq!(rfc6381_codec(&params()), "avc1.42001f");
    }

    #[test]
    fn avc_decoder_config_embeds_both_parameter_sets() {
        let record = avc_decoder_config_record(&params());
        assert_eq!(record[0], 1);
        assert_eq!(record[1], 0x42);
        assert_eq!(&record[6..8], &[0x00, SPS.len() as u8]);
        assert_eq!(&record[8..8 + SPS.len()], SPS);
    }

    #[test]
    fn annex_b_sample_is_length_prefixed() {
        let mut annex_b = Vec::new();
        annex_b.extend_from_slice(&[0, 0, 0, 1]);
        annex_b.extend_from_slice(&[NAL_UNIT_IDR_SLICE, 0xAA, 0xBB]);
        annex_b.extend_from_slice(&[0, 0, 1]);
        annex_b.extend_from_slice(&[NAL_UNIT_NON_IDR_SLICE, 0xCC]);
        let sample = annex_b_au_to_sample(&annex_b, 100, 100).unwrap();
        assert!(sample.is_keyframe);
        assert_eq!(
            sample.data,
            vec![0, 0, 0, 3, NAL_UNIT_IDR_SLICE, 0xAA, 0xBB, 0, 0, 0, 2, NAL_UNIT_NON_IDR_SLICE, 0xCC]
        );
    }

    #[test]
    fn rejects_access_unit_with_no_nal_units() {
        assert!(annex_b_au_to_sample(&[0xFF, 0xFF], 0, 0).is_err());
    }
}
