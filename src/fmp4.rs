// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Fragmented ISO-BMFF assembly: reads a `moov` (with `mvex`/`trex`
//! defaults) followed by one or more `moof`/`mdat` fragment pairs, and
//! flattens them into a single [`crate::model::Movie`] with one combined
//! sample table per track.
//!
//! Input samples already carry length-prefixed NAL units (ISO/IEC
//! 14496-15 AVC/HEVC sample format) and raw AAC frames, so unlike the TS
//! demuxer this module does no NAL scanning of its own — it only locates
//! and concatenates byte ranges.

use crate::isobmff::{self, boxes, Boxes};
use crate::model::{
    AudioSample, AudioTrack, AudioTrackInfo, Movie, VideoCodec, VideoParameterSets, VideoSample,
    VideoTrack, VideoTrackInfo, MOVIE_TIMESCALE,
};
use base::bail_t;
use std::collections::HashMap;

enum TrackKind {
    Video(VideoCodec, VideoParameterSets, u16, u16),
    Audio(u8, Vec<u8>),
}

struct TrackMeta {
    timescale: u32,
    kind: TrackKind,
}

fn rescale(ticks: i64, timescale: u32) -> i64 {
    (ticks as i128 * MOVIE_TIMESCALE as i128 / timescale as i128) as i64
}

/// Assembles a complete fragmented ISO-BMFF buffer into a [`Movie`].
pub fn assemble(data: &[u8]) -> Result<Movie, base::Error> {
    let mut moov_body: Option<&[u8]> = None;
    let mut top_level = Vec::new();
    for b in Boxes::new(data) {
        let b = b?;
        if isobmff::is_type(b.box_type, b"moov") {
            if moov_body.is_some() {
                log::debug!("ignoring additional moov box at offset {}", b.start);
            } else {
                moov_body = Some(b.body);
            }
        }
        top_level.push(b);
    }
    let moov_body = moov_body.ok_or_else(|| base::format_err_t!(MalformedContainer, "no moov box"))?;

    let mut raw_tracks = Vec::new();
    for trak in isobmff::find_all(moov_body, b"trak")? {
        let track_id = boxes::parse_tkhd(isobmff::require(trak, b"tkhd")?)?.track_id;
        let mdia = isobmff::require(trak, b"mdia")?;
        let timescale = boxes::parse_mdhd(isobmff::require(mdia, b"mdhd")?)?.timescale;
        let handler_type = boxes::parse_hdlr_type(isobmff::require(mdia, b"hdlr")?)?;
        let minf = isobmff::require(mdia, b"minf")?;
        let stbl = isobmff::require(minf, b"stbl")?;
        let stsd = isobmff::require(stbl, b"stsd")?;
        let entry = boxes::parse_stsd_first_entry(stsd)?;
        let kind = match (&handler_type, entry) {
            (b"vide", boxes::SampleEntry::Avc { width, height, parameter_sets }) => {
                TrackKind::Video(VideoCodec::Avc, VideoParameterSets::Avc(parameter_sets), width, height)
            }
            (b"vide", boxes::SampleEntry::Hevc { width, height, parameter_sets }) => {
                TrackKind::Video(VideoCodec::Hevc, VideoParameterSets::Hevc(parameter_sets), width, height)
            }
            (b"soun", boxes::SampleEntry::Aac { channels, audio_specific_config }) => {
                TrackKind::Audio(channels, audio_specific_config)
            }
            _ => bail_t!(UnsupportedCodec, "handler/sample entry combination not supported"),
        };
        raw_tracks.push((track_id, TrackMeta { timescale, kind }));
    }

    // The first moov's trackIds dictate the canonical tracks (spec "Track
    // identity"); fragments reference those same raw trackIds in tfhd, but
    // we key everything downstream by the *sorted* numeric order of the ids
    // the first moov declared, not the raw values themselves.
    let mut sorted_ids: Vec<u32> = raw_tracks.iter().map(|(id, _)| *id).collect();
    sorted_ids.sort_unstable();
    let canonical_id: HashMap<u32, u32> = sorted_ids
        .iter()
        .enumerate()
        .map(|(i, &raw)| (raw, i as u32 + 1))
        .collect();
    for (raw, &canon) in &canonical_id {
        if *raw != canon {
            log::debug!("remapping fragment track_id {} to canonical id {}", raw, canon);
        }
    }

    let mut tracks = HashMap::new();
    for (raw_id, meta) in raw_tracks {
        tracks.insert(canonical_id[&raw_id], meta);
    }
    let mut trex_defaults = HashMap::new();
    if let Some(mvex) = isobmff::find(moov_body, b"mvex")? {
        for trex_body in isobmff::find_all(mvex, b"trex")? {
            let trex = boxes::parse_trex(trex_body)?;
            if let Some(&canon) = canonical_id.get(&trex.track_id) {
                trex_defaults.insert(canon, trex);
            }
        }
    }

    let mut video_samples: Vec<VideoSample> = Vec::new();
    let mut audio_samples: Vec<AudioSample> = Vec::new();
    let mut video_track_id = None;
    let mut audio_track_id = None;

    for b in &top_level {
        if !isobmff::is_type(b.box_type, b"moof") {
            continue;
        }
        for traf in isobmff::find_all(b.body, b"traf")? {
            let tfhd = boxes::parse_tfhd(isobmff::require(traf, b"tfhd")?)?;
            let track_id = *canonical_id.get(&tfhd.track_id).ok_or_else(|| {
                base::format_err_t!(MalformedContainer, "traf names unknown track_id {}", tfhd.track_id)
            })?;
            let meta = tracks.get(&track_id).ok_or_else(|| {
                base::format_err_t!(MalformedContainer, "traf names unknown track_id {}", tfhd.track_id)
            })?;
            let trex = trex_defaults.get(&track_id).copied().unwrap_or_default();
            let base_media_decode_time = match isobmff::find(traf, b"tfdt")? {
                Some(tfdt_body) => boxes::parse_tfdt(tfdt_body)?,
                None => 0,
            };
            let trun = boxes::parse_trun(isobmff::require(traf, b"trun")?)?;

            let base = tfhd.base_data_offset.map(|o| o as usize).unwrap_or(b.start);
            let mut cursor = (base as i64 + trun.data_offset.unwrap_or(0) as i64) as usize;
            let mut dts = base_media_decode_time as i64;

            for (i, sample) in trun.samples.iter().enumerate() {
                let duration = sample
                    .duration
                    .or(tfhd.default_sample_duration)
                    .unwrap_or(trex.default_sample_duration);
                let size = sample
                    .size
                    .or(tfhd.default_sample_size)
                    .unwrap_or(trex.default_sample_size) as usize;
                if cursor + size > data.len() {
                    bail_t!(MalformedContainer, "trun sample runs past end of buffer");
                }
                let sample_data = data[cursor..cursor + size].to_vec();
                cursor += size;

                let cts = sample.composition_time_offset.unwrap_or(0) as i64;
                let pts = dts + cts;

                match &meta.kind {
                    TrackKind::Video(..) => {
                        video_track_id.get_or_insert(track_id);
                        let flags = sample
                            .flags
                            .or(if i == 0 { trun.first_sample_flags } else { None })
                            .or(tfhd.default_sample_flags)
                            .unwrap_or(trex.default_sample_flags);
                        let is_keyframe = flags & 0x0001_0000 == 0;
                        video_samples.push(VideoSample {
                            data: sample_data,
                            pts: rescale(pts, meta.timescale),
                            dts: rescale(dts, meta.timescale),
                            is_keyframe,
                        });
                    }
                    TrackKind::Audio(..) => {
                        audio_track_id.get_or_insert(track_id);
                        audio_samples.push(AudioSample {
                            data: sample_data,
                            pts: rescale(pts, meta.timescale),
                        });
                    }
                }
                dts += duration as i64;
            }
        }
    }

    let video = match video_track_id.and_then(|id| tracks.get(&id)) {
        Some(TrackMeta { kind: TrackKind::Video(codec, parameter_sets, width, height), .. }) => {
            if video_samples.is_empty() {
                bail_t!(EmptyStream, "video track produced zero samples");
            }
            Some(VideoTrack {
                info: VideoTrackInfo {
                    codec: *codec,
                    width: *width,
                    height: *height,
                    parameter_sets: parameter_sets.clone(),
                },
                samples: video_samples,
                edit_list: None,
            })
        }
        _ => None,
    };
    let audio = match audio_track_id.and_then(|id| tracks.get(&id)) {
        Some(TrackMeta { kind: TrackKind::Audio(channels, asc), timescale }) => {
            if audio_samples.is_empty() {
                bail_t!(EmptyStream, "audio track produced zero samples");
            }
            Some(AudioTrack {
                info: AudioTrackInfo {
                    sample_rate: *timescale,
                    channels: *channels,
                    audio_specific_config: asc.clone(),
                },
                samples: audio_samples,
                edit_list: None,
            })
        }
        _ => None,
    };

    if video.is_none() && audio.is_none() {
        bail_t!(MalformedContainer, "no moof/trun fragments found");
    }
    Ok(Movie { video, audio })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(fcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
        out.extend_from_slice(fcc);
        out.extend_from_slice(body);
        out
    }

    fn full(version: u8, flags: u32, rest: &[u8]) -> Vec<u8> {
        let mut out = vec![version];
        out.extend_from_slice(&flags.to_be_bytes()[1..]);
        out.extend_from_slice(rest);
        out
    }

    fn sample_entry_avc() -> Vec<u8> {
        let sps: &[u8] = &[0x67, 0x42, 0x00, 0x1f, 0xAA];
        let pps: &[u8] = &[0x68, 0xBB];
        let mut avcc = vec![1, sps[1], sps[2], sps[3], 0xff, 0xe1];
        avcc.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        avcc.extend_from_slice(sps);
        avcc.push(1);
        avcc.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        avcc.extend_from_slice(pps);
        let mut body = vec![0u8; 78];
        body[24..26].copy_from_slice(&320u16.to_be_bytes());
        body[26..28].copy_from_slice(&240u16.to_be_bytes());
        body.extend_from_slice(&bx(b"avcC", &avcc));
        bx(b"avc1", &body)
    }

    fn moov_one_video_track() -> Vec<u8> {
        moov_one_video_track_with_id(1)
    }

    fn moov_one_video_track_with_id(track_id: u8) -> Vec<u8> {
        let mut tkhd = vec![0u8; 12];
        tkhd[11] = track_id;
        let mdhd = full(0, 0, &{
            let mut r = vec![0u8; 8];
            r.extend_from_slice(&90_000u32.to_be_bytes());
            r.extend_from_slice(&0u32.to_be_bytes());
            r
        });
        let hdlr = full(0, 0, &{
            let mut r = vec![0u8; 4];
            r.extend_from_slice(b"vide");
            r.extend_from_slice(&[0u8; 12]);
            r
        });
        let mut stsd = full(0, 0, &1u32.to_be_bytes());
        stsd.extend_from_slice(&sample_entry_avc());
        let stbl = bx(b"stbl", &bx(b"stsd", &stsd));
        let minf = bx(b"minf", &stbl);
        let mdia = bx(b"mdia", &[bx(b"mdhd", &mdhd), bx(b"hdlr", &hdlr), minf].concat());
        let trak = bx(b"trak", &[bx(b"tkhd", &tkhd), mdia].concat());
        let mut trex = full(0, 0, &(track_id as u32).to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        trex.extend_from_slice(&3000u32.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        let mvex = bx(b"mvex", &bx(b"trex", &trex));
        bx(b"moov", &[trak, mvex].concat())
    }

    /// Builds a `moof` (with a given trun `data_offset`) over one track with
    /// two 4-byte samples, each a full second apart at the 90kHz timescale.
    fn moof_with_data_offset(data_offset: i32, tfdt: &[u8]) -> Vec<u8> {
        moof_with_track_id(1, data_offset, tfdt)
    }

    fn moof_with_track_id(track_id: u32, data_offset: i32, tfdt: &[u8]) -> Vec<u8> {
        let tfhd = full(0, 0x02_0000, &track_id.to_be_bytes()); // default-base-is-moof
        let mut trun = full(0, 0x01 | 0x100 | 0x200, &2u32.to_be_bytes()); // data_offset+duration+size
        trun.extend_from_slice(&data_offset.to_be_bytes());
        trun.extend_from_slice(&3000u32.to_be_bytes());
        trun.extend_from_slice(&4u32.to_be_bytes());
        trun.extend_from_slice(&3000u32.to_be_bytes());
        trun.extend_from_slice(&4u32.to_be_bytes());
        let traf = bx(b"traf", &[bx(b"tfhd", &tfhd), bx(b"tfdt", tfdt), bx(b"trun", &trun)].concat());
        let moof_body = [bx(b"mfhd", &full(0, 0, &1u32.to_be_bytes())), traf].concat();
        bx(b"moof", &moof_body)
    }

    #[test]
    fn assembles_single_fragment_video_track() {
        let moov = moov_one_video_track();
        let tfdt = full(1, 0, &0u64.to_be_bytes());

        // moof length doesn't depend on the data_offset value's magnitude
        // (both are 4-byte fields), so build once with a placeholder to
        // measure it, then rebuild with the real offset.
        let moof_len = moof_with_data_offset(0, &tfdt).len();
        let data_offset = (moof_len + 8 /* mdat header */) as i32; // default-base-is-moof
        let moof = moof_with_data_offset(data_offset, &tfdt);
        let mdat = bx(b"mdat", &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22]);

        let mut data = bx(b"ftyp", b"isom");
        data.extend_from_slice(&moov);
        data.extend_from_slice(&moof);
        data.extend_from_slice(&mdat);

        let movie = assemble(&data).unwrap();
        let video = movie.video.unwrap();
        assert_eq!(video.samples.len(), 2);
        assert_eq!(video.samples[0].data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(video.samples[1].data, vec![0xEE, 0xFF, 0x11, 0x22]);
        assert_eq!(video.samples[1].dts - video.samples[0].dts, 3000);
        assert_eq!(video.info.width, 320);
        assert_eq!(video.info.height, 240);
    }

    #[test]
    fn canonicalizes_a_non_sequential_raw_track_id() {
        // moov declares track_ID 5 instead of the usual 1; fragments
        // reference the same raw id in their tfhd. Assembly must still
        // succeed by mapping that single id to its sorted-order canonical
        // id rather than assuming raw ids already start at 1.
        let moov = moov_one_video_track_with_id(5);
        let tfdt = full(1, 0, &0u64.to_be_bytes());
        let moof_len = moof_with_track_id(5, 0, &tfdt).len();
        let data_offset = (moof_len + 8) as i32;
        let moof = moof_with_track_id(5, data_offset, &tfdt);
        let mdat = bx(b"mdat", &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22]);

        let mut data = bx(b"ftyp", b"isom");
        data.extend_from_slice(&moov);
        data.extend_from_slice(&moof);
        data.extend_from_slice(&mdat);

        let movie = assemble(&data).unwrap();
        let video = movie.video.unwrap();
        assert_eq!(video.samples.len(), 2);
        assert_eq!(video.samples[0].data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn ignores_a_second_top_level_moov_box() {
        crate::testutil::init();

        let moov = moov_one_video_track();
        let tfdt = full(1, 0, &0u64.to_be_bytes());
        let moof_len = moof_with_data_offset(0, &tfdt).len();
        let data_offset = (moof_len + 8) as i32;
        let moof = moof_with_data_offset(data_offset, &tfdt);
        let mdat = bx(b"mdat", &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22]);

        let mut data = bx(b"ftyp", b"isom");
        data.extend_from_slice(&moov);
        // A stray second moov (e.g. from a naively concatenated segment)
        // must be ignored rather than merged or treated as canonical.
        data.extend_from_slice(&moov);
        data.extend_from_slice(&moof);
        data.extend_from_slice(&mdat);

        let movie = assemble(&data).unwrap();
        let video = movie.video.unwrap();
        assert_eq!(video.samples.len(), 2);
        assert_eq!(video.info.width, 320);
    }
}
