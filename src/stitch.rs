// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Concatenates several [`Movie`]s, demuxed from consecutive source
//! segments, into one continuous timeline. Each segment after the first is
//! shifted so its first sample picks up exactly where the previous
//! segment's last sample left off — it does not reuse the segment's
//! original wall-clock timestamps.

use crate::model::{AudioTrack, Movie, VideoTrack};
use base::bail_t;

/// Stitches `movies` together in order. Every segment must agree on which
/// tracks are present (all-video-and-audio, video-only, or audio-only);
/// mismatched track layouts are an error rather than silently dropping a
/// track from some segments.
pub fn stitch(movies: Vec<Movie>) -> Result<Movie, base::Error> {
    if movies.is_empty() {
        bail_t!(InvalidArgument, "no segments to stitch");
    }
    let has_video = movies[0].video.is_some();
    let has_audio = movies[0].audio.is_some();
    for m in &movies[1..] {
        if m.video.is_some() != has_video || m.audio.is_some() != has_audio {
            bail_t!(InvalidArgument, "segments disagree on which tracks are present");
        }
    }

    let video = if has_video {
        Some(stitch_video(movies.iter().map(|m| m.video.as_ref().unwrap()))?)
    } else {
        None
    };
    let audio = if has_audio {
        Some(stitch_audio(movies.iter().map(|m| m.audio.as_ref().unwrap()))?)
    } else {
        None
    };
    Ok(Movie { video, audio })
}

fn stitch_video<'a>(mut segments: impl Iterator<Item = &'a VideoTrack>) -> Result<VideoTrack, base::Error> {
    let first = segments.next().expect("caller guarantees at least one segment");
    let mut out = first.clone();
    out.edit_list = None;
    let mut running_end = out.samples.last().map(|s| s.dts).unwrap_or(0);
    let mut last_delta = estimate_delta(&out.samples.iter().map(|s| s.dts).collect::<Vec<_>>());

    for seg in segments {
        if seg.samples.is_empty() {
            continue;
        }
        if seg.info.codec != out.info.codec {
            bail_t!(UnsupportedCodec, "stitched segments use different video codecs");
        }
        running_end += last_delta;
        let offset = running_end - seg.samples[0].dts;
        for s in &seg.samples {
            let mut s = s.clone();
            s.dts += offset;
            s.pts += offset;
            out.samples.push(s);
        }
        running_end = out.samples.last().unwrap().dts;
        last_delta = estimate_delta(&seg.samples.iter().map(|s| s.dts).collect::<Vec<_>>());
    }
    Ok(out)
}

fn stitch_audio<'a>(mut segments: impl Iterator<Item = &'a AudioTrack>) -> Result<AudioTrack, base::Error> {
    let first = segments.next().expect("caller guarantees at least one segment");
    let mut out = first.clone();
    out.edit_list = None;
    let mut running_end = out.samples.last().map(|s| s.pts).unwrap_or(0);
    let frame_duration = 1024i64 * crate::model::MOVIE_TIMESCALE as i64 / out.info.sample_rate as i64;

    for seg in segments {
        if seg.samples.is_empty() {
            continue;
        }
        running_end += frame_duration;
        let offset = running_end - seg.samples[0].pts;
        for s in &seg.samples {
            let mut s = s.clone();
            s.pts += offset;
            out.samples.push(s);
        }
        running_end = out.samples.last().unwrap().pts;
    }
    Ok(out)
}

/// The typical inter-sample delta, used to predict where a stitched-in
/// segment's first sample should land. Falls back to `1` for a
/// single-sample segment, matching [`crate::mp4::sample_deltas`]'s own
/// fallback for the same case.
fn estimate_delta(timestamps: &[i64]) -> i64 {
    match timestamps.len() {
        0 | 1 => 1,
        n => (timestamps[n - 1] - timestamps[0]) / (n as i64 - 1),
    }
    .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioSample, AudioTrackInfo, AvcParameterSets, VideoCodec, VideoParameterSets, VideoSample, VideoTrackInfo};

    fn video_track(dts_values: &[i64]) -> VideoTrack {
        VideoTrack {
            info: VideoTrackInfo {
                codec: VideoCodec::Avc,
                width: 640,
                height: 480,
                parameter_sets: VideoParameterSets::Avc(AvcParameterSets { sps: vec![0; 4], pps: vec![0; 2] }),
            },
            samples: dts_values
                .iter()
                .map(|&t| VideoSample { data: vec![1], pts: t, dts: t, is_keyframe: t == dts_values[0] })
                .collect(),
            edit_list: None,
        }
    }

    #[test]
    fn stitch_shifts_second_segment_to_continue_the_timeline() {
        let a = Movie { video: Some(video_track(&[0, 3000, 6000])), audio: None };
        // Second segment's own timestamps restart near zero, as a fresh TS
        // capture would; stitching must not reuse them verbatim.
        let b = Movie { video: Some(video_track(&[100, 3100, 6100])), audio: None };
        let out = stitch(vec![a, b]).unwrap();
        let video = out.video.unwrap();
        assert_eq!(video.samples.len(), 6);
        assert_eq!(video.samples[3].dts, 9000);
        assert_eq!(video.samples[5].dts, 15000);
    }

    #[test]
    fn stitch_rejects_mismatched_track_presence() {
        let a = Movie { video: Some(video_track(&[0, 3000])), audio: None };
        let b = Movie { video: None, audio: None };
        assert!(stitch(vec![a, b]).is_err());
    }

    #[test]
    fn stitch_rejects_empty_segment_list() {
        assert!(stitch(Vec::new()).is_err());
    }

    #[test]
    fn stitch_renumbers_audio_continuously() {
        let a = Movie {
            video: None,
            audio: Some(AudioTrack {
                info: AudioTrackInfo { sample_rate: 48_000, channels: 2, audio_specific_config: vec![0x12, 0x10] },
                samples: vec![
                    AudioSample { data: vec![1], pts: 0 },
                    AudioSample { data: vec![2], pts: 1024 },
                ],
                edit_list: None,
            }),
        };
        let b = Movie {
            video: None,
            audio: Some(AudioTrack {
                info: AudioTrackInfo { sample_rate: 48_000, channels: 2, audio_specific_config: vec![0x12, 0x10] },
                samples: vec![AudioSample { data: vec![3], pts: 500 }],
                edit_list: None,
            }),
        };
        let out = stitch(vec![a, b]).unwrap();
        let audio = out.audio.unwrap();
        assert_eq!(audio.samples.len(), 3);
        assert!(audio.samples[2].pts > audio.samples[1].pts);
    }
}
