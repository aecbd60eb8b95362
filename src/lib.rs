// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Remuxes MPEG-2 Transport Stream, fragmented ISO-BMFF, and HLS-referenced
//! segments into seekable, non-fragmented ISO-BMFF (`.mp4`), with
//! sample-accurate clipping and segment stitching.
//!
//! The crate is organized leaves-first: [`base::bitstream`] and
//! [`isobmff`] provide the byte/box primitives; [`ts`] and [`fmp4`] turn
//! source containers into a flat [`model::Movie`]; [`clip`] and [`stitch`]
//! transform that `Movie`; [`mp4`] writes it back out. The functions in this
//! module are the only public entry points — everything else is an
//! implementation detail callers shouldn't need to reach into.

#[cfg(test)]
pub(crate) mod testutil;

pub mod aac;
pub mod clip;
pub mod fmp4;
pub mod format;
pub mod h264;
pub mod hevc;
pub mod isobmff;
pub mod model;
pub mod mp4;
pub mod stitch;
pub mod ts;

pub use base::{Error, ErrorKind};
pub use model::Options;

use model::{EditListEntry, Movie};

/// Converts a complete MPEG-2 Transport Stream buffer into a non-fragmented
/// `.mp4`.
pub fn convert_ts(data: &[u8], options: &Options) -> Result<Vec<u8>, Error> {
    let mut movie = ts::demux(data)?;
    if options.is_clip() {
        clip::clip(&mut movie, options)?;
    } else {
        apply_ts_default_edit_list(&mut movie);
    }
    mp4::write(&movie)
}

/// Converts a fragmented ISO-BMFF buffer (`ftyp`+`moov`+ one or more
/// `moof`/`mdat` pairs) into a non-fragmented `.mp4`.
pub fn convert_fmp4(data: &[u8], options: &Options) -> Result<Vec<u8>, Error> {
    let mut movie = fmp4::assemble(data)?;
    if options.is_clip() {
        clip::clip(&mut movie, options)?;
    } else {
        apply_fmp4_default_edit_list(&mut movie);
    }
    mp4::write(&movie)
}

/// Demuxes and stitches a sequence of Transport Stream segments (e.g. the
/// `.ts` files an HLS playlist references) into one continuous `.mp4`.
/// `options` clips the *stitched* timeline, not each segment individually.
pub fn stitch_ts(segments: &[&[u8]], options: &Options) -> Result<Vec<u8>, Error> {
    let movies = segments
        .iter()
        .map(|seg| ts::demux(seg))
        .collect::<Result<Vec<_>, _>>()?;
    let mut movie = stitch::stitch(movies)?;
    if options.is_clip() {
        clip::clip(&mut movie, options)?;
    } else {
        apply_fmp4_default_edit_list(&mut movie);
    }
    mp4::write(&movie)
}

/// Demuxes and stitches a sequence of fragmented ISO-BMFF segments into one
/// continuous `.mp4`. `init`, when given, is a shared initialization segment
/// (a `moov` with no samples of its own, the way CMAF splits `init.mp4` from
/// per-segment `.m4s` files) prepended to every segment before assembly;
/// omit it when each segment already carries its own `moov`.
pub fn stitch_fmp4(segments: &[&[u8]], init: Option<&[u8]>, options: &Options) -> Result<Vec<u8>, Error> {
    let movies = segments
        .iter()
        .map(|seg| match init {
            Some(init) => {
                let mut combined = Vec::with_capacity(init.len() + seg.len());
                combined.extend_from_slice(init);
                combined.extend_from_slice(seg);
                fmp4::assemble(&combined)
            }
            None => fmp4::assemble(seg),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut movie = stitch::stitch(movies)?;
    if options.is_clip() {
        clip::clip(&mut movie, options)?;
    } else {
        apply_fmp4_default_edit_list(&mut movie);
    }
    mp4::write(&movie)
}

/// For a plain (non-clipped) TS conversion, an edit list is only needed
/// when the track's media doesn't already start at presentation time zero
/// — otherwise a player would already show the first sample at time zero
/// without one. Applied to the video track only: unlike a clip, a plain
/// conversion never trims audio, so there's no equivalent gap to hide
/// there.
fn apply_ts_default_edit_list(movie: &mut Movie) {
    if let Some(video) = movie.video.as_mut() {
        if let Some(first_pts) = video.samples.first().map(|s| s.pts) {
            if first_pts > 0 {
                video.edit_list = Some(EditListEntry {
                    segment_duration: video.duration().max(0) as u64,
                    media_time: first_pts,
                });
            }
        }
    }
}

/// fMP4 sources carry their own (often stale, zero-duration) edit lists,
/// which the assembler already discards; this default is rebuilt
/// unconditionally as a single full-span entry rather than only when
/// `first_pts > 0`, since a fragmented source's samples are never
/// guaranteed to already start at presentation time zero.
fn apply_fmp4_default_edit_list(movie: &mut Movie) {
    if let Some(video) = movie.video.as_mut() {
        if !video.samples.is_empty() {
            video.edit_list = Some(EditListEntry {
                segment_duration: video.duration().max(0) as u64,
                media_time: 0,
            });
        }
    }
}

/// One video keyframe's position in the analyzed stream.
#[derive(Clone, Copy, Debug)]
pub struct KeyframeInfo {
    /// Zero-based index into decode order.
    pub index: usize,
    pub time_s: f64,
}

/// The result of [`analyze_ts`]: stream metadata without producing an
/// output file.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub duration_s: f64,
    pub video_frame_count: usize,
    pub audio_frame_count: usize,
    pub keyframes: Vec<KeyframeInfo>,
    pub video_codec_name: Option<String>,
    pub audio_codec_name: Option<String>,
    pub audio_sample_rate: Option<u32>,
    pub audio_channels: Option<u8>,
}

/// Demuxes `data` and reports stream metadata without writing an `.mp4`.
pub fn analyze_ts(data: &[u8]) -> Result<AnalysisResult, Error> {
    let movie = ts::demux(data)?;
    let duration_s = movie.duration() as f64 / model::MOVIE_TIMESCALE as f64;

    let (video_frame_count, video_codec_name, keyframes) = match &movie.video {
        Some(v) => {
            let keyframes = v
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_keyframe)
                .map(|(index, s)| KeyframeInfo {
                    index,
                    time_s: s.dts as f64 / model::MOVIE_TIMESCALE as f64,
                })
                .collect();
            let name = match &v.info.parameter_sets {
                model::VideoParameterSets::Avc(params) => h264::rfc6381_codec(params),
                model::VideoParameterSets::Hevc(params) => hevc::rfc6381_codec(params),
            };
            (v.samples.len(), Some(name), keyframes)
        }
        None => (0, None, Vec::new()),
    };

    // AAC-LC is the only object type this crate emits (see AudioAccumulator::into_track).
    let (audio_frame_count, audio_codec_name, audio_sample_rate, audio_channels) = match &movie.audio {
        Some(a) => (
            a.samples.len(),
            Some("mp4a.40.2".to_string()),
            Some(a.info.sample_rate),
            Some(a.info.channels),
        ),
        None => (0, None, None, None),
    };

    Ok(AnalysisResult {
        duration_s,
        video_frame_count,
        audio_frame_count,
        keyframes,
        video_codec_name,
        audio_codec_name,
        audio_sample_rate,
        audio_channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ts_edit_list_only_applies_when_first_pts_is_nonzero() {
        let mut movie = Movie { video: None, audio: None };
        apply_ts_default_edit_list(&mut movie);
        assert!(movie.video.is_none());
    }
}
