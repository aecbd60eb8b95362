// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Trims a [`Movie`] to `[start_time_s, end_time_s)`, snapping the video
//! track's start to the preceding keyframe and using an `edts`/`elst` to
//! hide the resulting pre-roll rather than discarding it.

use crate::model::{AudioTrack, EditListEntry, Movie, Options, VideoTrack, MOVIE_TIMESCALE};
use base::bail_t;

/// The nominal decode gap between consecutive AAC frames in the movie
/// timescale, used to measure the trimmed audio window's duration for its
/// edit list (same formula [`crate::model::Movie::duration`] uses).
fn audio_frame_duration(audio: &AudioTrack) -> i64 {
    1024i64 * MOVIE_TIMESCALE as i64 / audio.info.sample_rate as i64
}

/// Applies `options` to `movie` in place. A no-op if `options.is_clip()` is
/// false.
pub fn clip(movie: &mut Movie, options: &Options) -> Result<(), base::Error> {
    if !options.is_clip() {
        return Ok(());
    }
    let (start_ticks, end_ticks) = resolve_bounds(options)?;

    if let Some(video) = movie.video.as_mut() {
        clip_video(video, start_ticks, end_ticks)?;
    }
    if let Some(audio) = movie.audio.as_mut() {
        clip_audio(audio, start_ticks, end_ticks)?;
    }
    if movie.video.as_ref().map_or(true, |v| v.samples.is_empty())
        && movie.audio.as_ref().map_or(true, |a| a.samples.is_empty())
    {
        bail_t!(InvalidArgument, "clip range contains no samples on any track");
    }
    Ok(())
}

fn resolve_bounds(options: &Options) -> Result<(Option<i64>, Option<i64>), base::Error> {
    let to_ticks = |s: f64| (s * MOVIE_TIMESCALE as f64).round() as i64;
    let start = options.start_time_s.map(to_ticks);
    let end = options.end_time_s.map(to_ticks);
    if let (Some(s), Some(e)) = (start, end) {
        if s >= e {
            bail_t!(InvalidArgument, "start_time_s {} >= end_time_s {}", s, e);
        }
    }
    Ok((start, end))
}

/// Finds the last keyframe at or before `start`, so decoding can begin there
/// even though playback should appear to start at `start` itself.
fn keyframe_snap_index(video: &VideoTrack, start: i64) -> usize {
    video
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_keyframe && s.dts <= start)
        .map(|(i, _)| i)
        .last()
        .unwrap_or(0)
}

fn clip_video(video: &mut VideoTrack, start: Option<i64>, end: Option<i64>) -> Result<(), base::Error> {
    let start = start.unwrap_or(i64::MIN);
    let end = end.unwrap_or(i64::MAX);

    let keep_from = if start <= i64::MIN {
        0
    } else {
        keyframe_snap_index(video, start)
    };
    let keep_to = video
        .samples
        .iter()
        .position(|s| s.dts >= end)
        .unwrap_or(video.samples.len());
    if keep_from >= keep_to {
        video.samples.clear();
        video.edit_list = None;
        return Ok(());
    }

    let decode_start_dts = video.samples[keep_from].dts;
    let presentation_start = start.max(decode_start_dts);
    video.samples.truncate(keep_to);
    video.samples.drain(0..keep_from);

    for s in video.samples.iter_mut() {
        s.dts -= decode_start_dts;
        s.pts -= decode_start_dts;
    }

    let pre_roll = presentation_start - decode_start_dts;
    video.edit_list = if pre_roll > 0 {
        let duration = video.duration();
        Some(EditListEntry {
            segment_duration: duration.max(0) as u64,
            media_time: pre_roll,
        })
    } else {
        None
    };
    Ok(())
}

fn clip_audio(audio: &mut AudioTrack, start: Option<i64>, end: Option<i64>) -> Result<(), base::Error> {
    let start = start.unwrap_or(i64::MIN);
    let end = end.unwrap_or(i64::MAX);

    let keep_from = audio
        .samples
        .iter()
        .position(|s| s.pts >= start)
        .unwrap_or(audio.samples.len());
    let keep_to = audio
        .samples
        .iter()
        .position(|s| s.pts >= end)
        .unwrap_or(audio.samples.len());
    if keep_from >= keep_to {
        audio.samples.clear();
        audio.edit_list = None;
        return Ok(());
    }

    let base_pts = audio.samples[keep_from].pts;
    audio.samples.truncate(keep_to);
    audio.samples.drain(0..keep_from);
    for s in audio.samples.iter_mut() {
        s.pts -= base_pts;
    }

    // Audio is trimmed exactly to the requested window, so its edit list
    // always starts at media_time 0 — only the segment_duration reflects
    // how much of the track survived.
    let duration = audio.duration(audio_frame_duration(audio));
    audio.edit_list = Some(EditListEntry { segment_duration: duration.max(0) as u64, media_time: 0 });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioSample, AudioTrackInfo, AvcParameterSets, VideoCodec, VideoParameterSets, VideoSample, VideoTrackInfo};

    fn track_with_gop(keyframe_every: usize, count: usize) -> VideoTrack {
        let samples = (0..count)
            .map(|i| VideoSample {
                data: vec![i as u8],
                pts: (i as i64) * 3000,
                dts: (i as i64) * 3000,
                is_keyframe: i % keyframe_every == 0,
            })
            .collect();
        VideoTrack {
            info: VideoTrackInfo {
                codec: VideoCodec::Avc,
                width: 1920,
                height: 1080,
                parameter_sets: VideoParameterSets::Avc(AvcParameterSets { sps: vec![0; 4], pps: vec![0; 2] }),
            },
            samples,
            edit_list: None,
        }
    }

    fn movie_with_gop(keyframe_every: usize, count: usize) -> Movie {
        Movie { video: Some(track_with_gop(keyframe_every, count)), audio: None }
    }

    #[test]
    fn clip_snaps_start_to_preceding_keyframe_and_adds_edit_list() {
        let mut movie = movie_with_gop(5, 20);
        // start at sample index 7 (dts 21000), not itself a keyframe; the
        // preceding keyframe is index 5 (dts 15000).
        let options = Options { start_time_s: Some(21000.0 / MOVIE_TIMESCALE as f64), end_time_s: None };
        clip(&mut movie, &options).unwrap();
        let video = movie.video.unwrap();
        assert_eq!(video.samples[0].dts, 0); // renumbered from the keyframe
        let edit = video.edit_list.unwrap();
        assert_eq!(edit.media_time, 21000 - 15000);
    }

    #[test]
    fn clip_trims_trailing_samples_at_end_time() {
        let mut movie = movie_with_gop(5, 20);
        let options = Options { start_time_s: None, end_time_s: Some(30000.0 / MOVIE_TIMESCALE as f64) };
        clip(&mut movie, &options).unwrap();
        let video = movie.video.unwrap();
        assert_eq!(video.samples.len(), 10); // dts 0..30000 in steps of 3000
    }

    #[test]
    fn clip_on_keyframe_boundary_needs_no_edit_list() {
        let mut movie = movie_with_gop(5, 20);
        let options = Options { start_time_s: Some(15000.0 / MOVIE_TIMESCALE as f64), end_time_s: None };
        clip(&mut movie, &options).unwrap();
        assert!(movie.video.unwrap().edit_list.is_none());
    }

    #[test]
    fn rejects_start_at_or_after_end() {
        let mut movie = movie_with_gop(5, 20);
        let options = Options { start_time_s: Some(1.0), end_time_s: Some(0.5) };
        assert!(clip(&mut movie, &options).is_err());
    }

    #[test]
    fn clip_range_past_the_end_yields_no_samples_error() {
        let mut movie = movie_with_gop(5, 20);
        let options = Options { start_time_s: Some(1000.0), end_time_s: None };
        assert!(clip(&mut movie, &options).is_err());
    }

    #[test]
    fn audio_samples_are_dropped_and_renumbered_independently_of_video() {
        let mut movie = movie_with_gop(5, 20);
        movie.audio = Some(AudioTrack {
            info: AudioTrackInfo { sample_rate: 48_000, channels: 2, audio_specific_config: vec![0x12, 0x10] },
            samples: (0..10)
                .map(|i| AudioSample { data: vec![i as u8], pts: i as i64 * 1920 })
                .collect(),
            edit_list: None,
        });
        let options = Options { start_time_s: Some(3840.0 / MOVIE_TIMESCALE as f64), end_time_s: None };
        clip(&mut movie, &options).unwrap();
        let audio = movie.audio.unwrap();
        assert_eq!(audio.samples[0].pts, 0);
    }

    #[test]
    fn clipped_audio_gets_a_parallel_edit_list_starting_at_zero() {
        let mut movie = movie_with_gop(5, 20);
        movie.audio = Some(AudioTrack {
            info: AudioTrackInfo { sample_rate: 48_000, channels: 2, audio_specific_config: vec![0x12, 0x10] },
            samples: (0..10)
                .map(|i| AudioSample { data: vec![i as u8], pts: i as i64 * 1920 })
                .collect(),
            edit_list: None,
        });
        let options = Options { start_time_s: Some(3840.0 / MOVIE_TIMESCALE as f64), end_time_s: None };
        clip(&mut movie, &options).unwrap();
        let audio = movie.audio.unwrap();
        let edit = audio.edit_list.unwrap();
        assert_eq!(edit.media_time, 0);
        assert!(edit.segment_duration > 0);
    }
}
