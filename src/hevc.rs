// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Minimal HEVC (H.265) support: NAL classification, dimension parsing for
//! the common single-temporal-layer case, and an `hvcC` box built by
//! passing the VPS/SPS/PPS NALs through unparsed. See DESIGN.md for why
//! this crate doesn't do a full `profile_tier_level` walk.

use crate::model::HevcParameterSets;
use base::bail_t;
use base::bitstream::BitReader;

const NAL_UNIT_TYPE_VPS: u8 = 32;
const NAL_UNIT_TYPE_SPS: u8 = 33;
const NAL_UNIT_TYPE_PPS: u8 = 34;
const NAL_UNIT_TYPE_BLA_W_LP: u8 = 16;
const NAL_UNIT_TYPE_CRA: u8 = 21;

/// HEVC's NAL header is 2 bytes; `nal_unit_type` is bits 1-6 of the first.
pub fn nal_unit_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3f
}

pub fn is_parameter_set(nal_type: u8) -> bool {
    matches!(
        nal_type,
        NAL_UNIT_TYPE_VPS | NAL_UNIT_TYPE_SPS | NAL_UNIT_TYPE_PPS
    )
}

/// A picture is a random access point if it carries a BLA/IDR/CRA NAL
/// (types 16 through 21, ITU-T H.265 table 7-1).
pub fn is_keyframe(nals: &[&[u8]]) -> bool {
    nals.iter()
        .any(|n| (NAL_UNIT_TYPE_BLA_W_LP..=NAL_UNIT_TYPE_CRA).contains(&nal_unit_type(n)))
}

/// Parses `pic_width_in_luma_samples`/`pic_height_in_luma_samples` out of a
/// raw SPS NAL (2-byte header included). Only handles `sps_max_sub_layers
/// _minus1 == 0`, which is what every encoder this crate has been pointed
/// at emits; anything else is rejected rather than mis-parsed.
pub fn parse_sps_dimensions(sps: &[u8]) -> Result<(u16, u16), base::Error> {
    if sps.len() < 16 {
        bail_t!(MalformedContainer, "HEVC SPS too short");
    }
    let mut r = BitReader::new(&sps[2..]);
    let _vps_id = r.read_bits(4);
    let max_sub_layers_minus1 = r.read_bits(3);
    let _temporal_id_nesting = r.read_bits(1);
    if max_sub_layers_minus1 != 0 {
        bail_t!(
            UnsupportedCodec,
            "HEVC streams with temporal sublayers are not supported"
        );
    }
    r.skip_bits(12 * 8); // profile_tier_level general fields, byte-aligned here
    let _sps_id = r.read_ue();
    let chroma_format_idc = r.read_ue();
    if chroma_format_idc == 3 {
        r.read_bits(1); // separate_colour_plane_flag
    }
    let width = r.read_ue();
    let height = r.read_ue();
    Ok((width as u16, height as u16))
}

/// Builds the `HEVCDecoderConfigurationRecord` body (ISO/IEC 14496-15
/// §8.3.3.1.2), with one array entry per parameter set type and
/// `lengthSizeMinusOne = 3` to match the samples this crate writes.
pub fn hevc_decoder_config_record(params: &HevcParameterSets) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(1); // configurationVersion
    out.push(params.sps.get(3).copied().unwrap_or(0)); // general_profile_space/tier/idc byte
    out.extend_from_slice(&params.sps.get(4..8).map(<[u8]>::to_vec).unwrap_or_else(|| vec![0; 4]));
    out.extend_from_slice(&params.sps.get(8..14).map(<[u8]>::to_vec).unwrap_or_else(|| vec![0; 6]));
    out.push(params.sps.get(14).copied().unwrap_or(0)); // general_level_idc
    out.extend_from_slice(&[0xf0, 0x00]); // min_spatial_segmentation_idc, reserved bits set
    out.push(0xfc); // parallelismType reserved
    out.push(0xfd); // chromaFormat reserved (4:2:0 assumed)
    out.push(0xf8); // bitDepthLumaMinus8 reserved
    out.push(0xf8); // bitDepthChromaMinus8 reserved
    out.extend_from_slice(&[0x00, 0x00]); // avgFrameRate
    out.push(0x03); // constantFrameRate(2)=0 numTemporalLayers(3)=0 temporalIdNested(1)=0 lengthSizeMinusOne(2)=3
    out.push(3); // numOfArrays
    for (nal_type, nal) in [
        (NAL_UNIT_TYPE_VPS, &params.vps),
        (NAL_UNIT_TYPE_SPS, &params.sps),
        (NAL_UNIT_TYPE_PPS, &params.pps),
    ] {
        out.push(0x80 | nal_type); // array_completeness(1) reserved(1) NAL_unit_type(6)
        out.extend_from_slice(&[0x00, 0x01]); // numNalus = 1
        out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

pub fn rfc6381_codec(params: &HevcParameterSets) -> String {
    let general_profile_idc = params.sps.get(3).copied().unwrap_or(0) & 0x1f;
    let general_level_idc = params.sps.get(14).copied().unwrap_or(0);
    format!("hev1.{}.4.L{}.B0", general_profile_idc, general_level_idc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_detects_idr_and_cra() {
        let idr = [(19u8) << 1, 0];
        let non_irap = [(1u8) << 1, 0];
        assert!(is_keyframe(&[&idr]));
        assert!(!is_keyframe(&[&non_irap]));
    }

    #[test]
    fn decoder_config_embeds_all_three_arrays() {
        let params = HevcParameterSets {
            vps: vec![0x40, 0x01, 0xAA],
            sps: vec![0x42, 0x01, 0x01, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 0, 93, 0xBB],
            pps: vec![0x44, 0x01, 0xCC],
        };
        let record = hevc_decoder_config_record(&params);
        assert_eq!(record[0], 1);
        assert_eq!(record[15], 3);
    }
}
