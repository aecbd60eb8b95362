// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! MPEG-2 Transport Stream demuxing: finds the PAT/PMT for the first
//! program, then reassembles the video and audio elementary streams named
//! there into a [`crate::model::Movie`].

pub mod audio;
pub mod packet;
pub mod pes;
pub mod psi;
pub mod video;

use crate::model::{Movie, VideoCodec};
use audio::{AudioAccumulator, AudioFraming};
use base::bail_t;
use psi::{SectionAssembler, StreamType};
use video::VideoAccumulator;

struct Streams {
    video: Option<(u16, VideoCodec)>,
    audio: Option<(u16, AudioFraming)>,
}

fn find_streams(data: &[u8]) -> Result<Streams, base::Error> {
    let mut pat_asm = SectionAssembler::new();
    let mut pmt_asm = SectionAssembler::new();
    let mut pmt_pid = None;

    for pkt in packet::Packets::new(data)? {
        let pkt = pkt?;
        if pkt.pid == packet::PAT_PID {
            if let Some(payload) = pkt.payload {
                if let Some(section) = pat_asm.feed(payload, pkt.payload_unit_start) {
                    pmt_pid = Some(psi::parse_pat(&section)?);
                }
            }
        } else if Some(pkt.pid) == pmt_pid {
            if let Some(payload) = pkt.payload {
                if let Some(section) = pmt_asm.feed(payload, pkt.payload_unit_start) {
                    let pmt = psi::Pmt::parse(&section)?;
                    pmt.reject_unsupported()?;
                    let video = pmt.video_stream().map(|s| {
                        let codec = match s.stream_type {
                            StreamType::Avc => VideoCodec::Avc,
                            StreamType::Hevc => VideoCodec::Hevc,
                            _ => unreachable!("is_video() only matches Avc/Hevc"),
                        };
                        (s.pid, codec)
                    });
                    let audio = pmt.audio_stream().map(|s| {
                        let framing = match s.stream_type {
                            StreamType::AdtsAac => AudioFraming::Adts,
                            StreamType::LatmAac => AudioFraming::Loas,
                            _ => unreachable!("is_audio() only matches AdtsAac/LatmAac"),
                        };
                        (s.pid, framing)
                    });
                    return Ok(Streams { video, audio });
                }
            }
        }
    }
    bail_t!(MalformedContainer, "no PMT found for any program in PAT");
}

/// Demuxes a complete Transport Stream buffer into a [`Movie`].
pub fn demux(data: &[u8]) -> Result<Movie, base::Error> {
    let streams = find_streams(data)?;
    if streams.video.is_none() && streams.audio.is_none() {
        bail_t!(MalformedContainer, "PMT names no video or audio stream");
    }

    let mut video_acc = streams
        .video
        .map(|(_, codec)| VideoAccumulator::new(codec));
    let mut audio_acc = streams
        .audio
        .map(|(_, framing)| AudioAccumulator::new(framing));
    let video_pid = streams.video.map(|(pid, _)| pid);
    let audio_pid = streams.audio.map(|(pid, _)| pid);

    let mut video_re = pes::Reassembler::new();
    let mut audio_re = pes::Reassembler::new();

    for pkt in packet::Packets::new(data)? {
        let pkt = pkt?;
        let payload = match pkt.payload {
            Some(p) => p,
            None => continue,
        };
        if Some(pkt.pid) == video_pid {
            if let Some(raw) = video_re.feed(payload, pkt.payload_unit_start) {
                feed_video(&mut video_acc, raw)?;
            }
        } else if Some(pkt.pid) == audio_pid {
            if let Some(raw) = audio_re.feed(payload, pkt.payload_unit_start) {
                feed_audio(&mut audio_acc, raw)?;
            }
        }
    }
    if let Some(raw) = video_re.finish() {
        feed_video(&mut video_acc, raw)?;
    }
    if let Some(raw) = audio_re.finish() {
        feed_audio(&mut audio_acc, raw)?;
    }

    let mut video = video_acc.map(|a| a.into_track()).transpose()?;
    let mut audio = audio_acc.map(|a| a.into_track()).transpose()?;
    normalize_timestamps(&mut video, &mut audio);
    Ok(Movie { video, audio })
}

/// Shifts every sample's timestamps so the earliest of the two tracks' first
/// presentation timestamps lands at zero, per spec I6. A TS capture's PTS
/// values are arbitrary 33-bit wall-clock ticks carried over from the
/// encoder; downstream edit-list math assumes a timeline that starts at (or
/// near) zero.
fn normalize_timestamps(
    video: &mut Option<crate::model::VideoTrack>,
    audio: &mut Option<crate::model::AudioTrack>,
) {
    let v0 = video.as_ref().and_then(|v| v.samples.first()).map(|s| s.pts);
    let a0 = audio.as_ref().and_then(|a| a.samples.first()).map(|s| s.pts);
    let min_pts = match (v0, a0) {
        (Some(v), Some(a)) => v.min(a),
        (Some(v), None) => v,
        (None, Some(a)) => a,
        (None, None) => return,
    };
    if min_pts == 0 {
        return;
    }
    if let Some(v) = video {
        for s in v.samples.iter_mut() {
            s.pts -= min_pts;
            s.dts -= min_pts;
        }
    }
    if let Some(a) = audio {
        for s in a.samples.iter_mut() {
            s.pts -= min_pts;
        }
    }
}

fn feed_video(acc: &mut Option<VideoAccumulator>, raw: Vec<u8>) -> Result<(), base::Error> {
    if let Some(acc) = acc.as_mut() {
        // A malformed individual PES packet (e.g. no PTS) is skipped rather
        // than aborting the whole demux; broadcast captures routinely carry
        // a handful of these around discontinuities.
        match pes::decode(&raw) {
            Ok(p) => acc.push_pes(p)?,
            Err(e) => log::debug!("skipping unparseable video PES: {}", e),
        }
    }
    Ok(())
}

fn feed_audio(acc: &mut Option<AudioAccumulator>, raw: Vec<u8>) -> Result<(), base::Error> {
    if let Some(acc) = acc.as_mut() {
        match pes::decode(&raw) {
            Ok(p) => acc.push_pes(p)?,
            Err(e) => log::debug!("skipping unparseable audio PES: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioSample, AudioTrack, AudioTrackInfo, AvcParameterSets, VideoParameterSets, VideoSample, VideoTrack, VideoTrackInfo};

    fn video_track(first_pts: i64) -> VideoTrack {
        VideoTrack {
            info: VideoTrackInfo {
                codec: VideoCodec::Avc,
                width: 640,
                height: 480,
                parameter_sets: VideoParameterSets::Avc(AvcParameterSets { sps: vec![0; 4], pps: vec![0; 2] }),
            },
            samples: vec![
                VideoSample { data: vec![1], pts: first_pts, dts: first_pts, is_keyframe: true },
                VideoSample { data: vec![2], pts: first_pts + 3000, dts: first_pts + 3000, is_keyframe: false },
            ],
            edit_list: None,
        }
    }

    fn audio_track(first_pts: i64) -> AudioTrack {
        AudioTrack {
            info: AudioTrackInfo { sample_rate: 48_000, channels: 2, audio_specific_config: vec![0x12, 0x10] },
            samples: vec![AudioSample { data: vec![9], pts: first_pts }],
            edit_list: None,
        }
    }

    #[test]
    fn normalize_shifts_both_tracks_by_the_earlier_first_pts() {
        let mut video = Some(video_track(180_000));
        let mut audio = Some(audio_track(177_000));
        normalize_timestamps(&mut video, &mut audio);
        assert_eq!(video.as_ref().unwrap().samples[0].pts, 3000);
        assert_eq!(audio.as_ref().unwrap().samples[0].pts, 0);
    }

    #[test]
    fn normalize_is_a_no_op_when_earliest_pts_is_already_zero() {
        let mut video = Some(video_track(0));
        let mut audio = Some(audio_track(500));
        normalize_timestamps(&mut video, &mut audio);
        assert_eq!(video.as_ref().unwrap().samples[0].pts, 0);
        assert_eq!(audio.as_ref().unwrap().samples[0].pts, 500);
    }

    #[test]
    fn normalize_handles_a_video_only_movie() {
        let mut video = Some(video_track(9000));
        let mut audio: Option<AudioTrack> = None;
        normalize_timestamps(&mut video, &mut audio);
        assert_eq!(video.as_ref().unwrap().samples[0].pts, 0);
    }

    #[test]
    fn feed_video_skips_a_pes_packet_with_no_payload_rather_than_aborting() {
        crate::testutil::init();

        let mut acc = Some(VideoAccumulator::new(VideoCodec::Avc));
        // Too short to contain even a PES header; decode() will err and the
        // packet should be dropped rather than propagated.
        let raw = vec![0x00, 0x00, 0x01, 0xE0];
        feed_video(&mut acc, raw).unwrap();
        // No access units were ever pushed, so the accumulator is still empty.
        assert!(acc.unwrap().into_track().is_err());
    }
}
