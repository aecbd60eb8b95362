// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! The in-memory representation shared by every component: produced by the
//! TS demuxer or the fMP4 assembler, mutated only by the clip/stitch step,
//! and consumed read-only by the writer.
//!
//! All timestamps (`pts`/`dts` on both video and audio samples) are kept in
//! the 90 kHz movie timescale from the moment they're produced until the
//! writer rescales per-track durations into each track's own media
//! timescale (video stays 90 kHz; audio becomes its sampling rate).

/// Ticks per second shared by the movie timescale and MPEG-TS PTS/DTS.
pub const MOVIE_TIMESCALE: u32 = 90_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    Avc,
    Hevc,
}

/// AVC (H.264) decoder configuration: exactly one SPS and one PPS, matching
/// `lengthSizeMinusOne = 3` (4-byte NAL lengths) throughout this crate.
#[derive(Clone, Debug)]
pub struct AvcParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// HEVC (H.265) parameter sets, passed straight through into a `hvcC` box
/// without any re-encoding.
#[derive(Clone, Debug)]
pub struct HevcParameterSets {
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum VideoParameterSets {
    Avc(AvcParameterSets),
    Hevc(HevcParameterSets),
}

#[derive(Clone, Debug)]
pub struct VideoTrackInfo {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub parameter_sets: VideoParameterSets,
}

#[derive(Clone, Debug)]
pub struct AudioTrackInfo {
    /// AAC sampling frequency in Hz; defaults to 48 000 if undetectable (I5).
    pub sample_rate: u32,
    pub channels: u8,
    /// 2-byte (or longer, for SBR/PS) `AudioSpecificConfig`.
    pub audio_specific_config: Vec<u8>,
}

/// One coded video access unit, already in length-prefixed AVC/HEVC sample
/// format (4-byte big-endian NAL lengths) — ready to drop straight into
/// `mdat`. `pts`/`dts` are 90 kHz ticks, widened from the wire format's
/// 33-bit unsigned fields to signed 64-bit so stitched timelines don't
/// overflow.
#[derive(Clone, Debug)]
pub struct VideoSample {
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub is_keyframe: bool,
}

/// One raw AAC frame (ADTS header already stripped), with a 90 kHz `pts`.
#[derive(Clone, Debug)]
pub struct AudioSample {
    pub data: Vec<u8>,
    pub pts: i64,
}

/// A single `elst` entry: `segment_duration` in movie timescale,
/// `media_time` in the track's own media timescale, rate fixed at 1.0.
#[derive(Clone, Copy, Debug)]
pub struct EditListEntry {
    pub segment_duration: u64,
    pub media_time: i64,
}

#[derive(Clone, Debug)]
pub struct VideoTrack {
    pub info: VideoTrackInfo,
    /// Decode order (I1): PTS may be non-monotonic, DTS must not decrease.
    pub samples: Vec<VideoSample>,
    pub edit_list: Option<EditListEntry>,
}

#[derive(Clone, Debug)]
pub struct AudioTrack {
    pub info: AudioTrackInfo,
    pub samples: Vec<AudioSample>,
    pub edit_list: Option<EditListEntry>,
}

/// The flat, fully-resolved representation the writer consumes. Produced by
/// the TS demuxer (`ts::demux`) or the fMP4 assembler (`fmp4::assemble`),
/// optionally transformed by `clip`/`stitch`, then handed to `mp4::write`.
#[derive(Clone, Debug, Default)]
pub struct Movie {
    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTrack>,
}

impl VideoTrack {
    pub fn duration(&self) -> i64 {
        track_duration(&self.samples, |s| s.dts)
    }
}

impl Movie {
    /// The movie's overall duration in the 90 kHz movie timescale: the
    /// longer of its video and audio track durations.
    pub fn duration(&self) -> i64 {
        let video = self.video.as_ref().map(VideoTrack::duration).unwrap_or(0);
        let audio = self
            .audio
            .as_ref()
            .map(|a| {
                let frame_duration = 1024i64 * MOVIE_TIMESCALE as i64 / a.info.sample_rate as i64;
                a.duration(frame_duration)
            })
            .unwrap_or(0);
        video.max(audio)
    }
}

impl AudioTrack {
    pub fn duration(&self, average_frame_duration: i64) -> i64 {
        match self.samples.len() {
            0 => 0,
            1 => average_frame_duration,
            _ => {
                let first = self.samples.first().unwrap().pts;
                let last = self.samples.last().unwrap().pts;
                (last - first) + average_frame_duration
            }
        }
    }
}

fn track_duration<T>(samples: &[T], ts: impl Fn(&T) -> i64) -> i64 {
    match samples.len() {
        0 => 0,
        1 => 0,
        _ => {
            let first = ts(&samples[0]);
            let last = ts(&samples[samples.len() - 1]);
            let avg = (last - first) / (samples.len() as i64 - 1);
            (last - first) + avg.max(1)
        }
    }
}

/// Input to every public conversion entry point.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Begin the clip at this second. Decoding actually starts at the
    /// preceding keyframe; the gap is hidden with edit-list pre-roll rather
    /// than discarded (see [`crate::clip`]).
    pub start_time_s: Option<f64>,
    /// End the clip at this second, exclusive at the sample level.
    pub end_time_s: Option<f64>,
}

impl Options {
    pub fn is_clip(&self) -> bool {
        self.start_time_s.is_some() || self.end_time_s.is_some()
    }
}
