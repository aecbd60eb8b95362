// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Accumulates one audio elementary stream's PES packets into an
//! `AudioTrack`. Handles both ADTS (stream type 0x0F) and LOAS/LATM (stream
//! type 0x11) framing; the latter is a minimal scanner (see `crate::aac`).

use crate::aac;
use crate::model::{AudioSample, AudioTrack, AudioTrackInfo, MOVIE_TIMESCALE};
use crate::ts::pes::PesPacket;
use base::bail_t;
use base::bitstream::BitReader;

#[derive(Copy, Clone)]
pub enum AudioFraming {
    Adts,
    Loas,
}

pub struct AudioAccumulator {
    framing: AudioFraming,
    sample_rate: Option<u32>,
    channels: Option<u8>,
    samples: Vec<AudioSample>,
    /// The PTS the next frame would carry if its PES has none: the last
    /// emitted frame's PTS plus its duration. `None` until a first frame
    /// with a real PTS has been seen — a PES without a PTS is dropped until
    /// there's a running timestamp to carry forward.
    next_pts: Option<i64>,
    /// Trailing ADTS bytes that didn't form a complete frame within the PES
    /// they arrived in, prepended to the next PES's payload.
    adts_residual: Vec<u8>,
}

impl AudioAccumulator {
    pub fn new(framing: AudioFraming) -> Self {
        AudioAccumulator {
            framing,
            sample_rate: None,
            channels: None,
            samples: Vec::new(),
            next_pts: None,
            adts_residual: Vec::new(),
        }
    }

    pub fn push_pes(&mut self, pes: PesPacket) -> Result<(), base::Error> {
        match self.framing {
            AudioFraming::Adts => self.push_adts(&pes),
            AudioFraming::Loas => self.push_loas(&pes),
        }
    }

    fn push_adts(&mut self, pes: &PesPacket) -> Result<(), base::Error> {
        let mut pts = match pes.pts.or(self.next_pts) {
            Some(pts) => pts,
            None => return Ok(()), // no PTS yet and no running timestamp: drop
        };
        let mut buf = std::mem::take(&mut self.adts_residual);
        buf.extend_from_slice(&pes.payload);
        let remainder = aac::scan_adts_frames(&buf, |payload, header| {
            if self.sample_rate.is_none() {
                let rate = aac::sample_rate_for_index(header.sampling_frequency_index)
                    .unwrap_or(48_000);
                self.sample_rate = Some(rate);
                self.channels = Some(header.channel_configuration.max(1));
            }
            let frame_duration = 1024 * MOVIE_TIMESCALE as i64 / self.sample_rate.unwrap() as i64;
            self.samples.push(AudioSample {
                data: payload.to_vec(),
                pts,
            });
            pts += frame_duration;
        })?;
        self.adts_residual = remainder.to_vec();
        self.next_pts = Some(pts);
        Ok(())
    }

    fn push_loas(&mut self, pes: &PesPacket) -> Result<(), base::Error> {
        let mut pts = match pes.pts.or(self.next_pts) {
            Some(pts) => pts,
            None => return Ok(()),
        };
        let mut frame_duration = 0i64;
        aac::scan_loas_frames(&pes.payload, |frame| {
            let payload = if self.sample_rate.is_none() {
                match parse_config_and_split(frame) {
                    Ok((sfi, channels, rest)) => {
                        let rate = aac::sample_rate_for_index(sfi).unwrap_or(48_000);
                        self.sample_rate = Some(rate);
                        self.channels = Some(channels.max(1));
                        rest
                    }
                    Err(_) => frame,
                }
            } else {
                frame
            };
            if let Some(rate) = self.sample_rate {
                frame_duration = 1024 * MOVIE_TIMESCALE as i64 / rate as i64;
            }
            self.samples.push(AudioSample {
                data: payload.to_vec(),
                pts,
            });
            pts += frame_duration;
        });
        self.next_pts = Some(pts);
        Ok(())
    }

    pub fn into_track(self) -> Result<AudioTrack, base::Error> {
        if self.samples.is_empty() {
            bail_t!(EmptyStream, "audio PID produced zero frames");
        }
        let sample_rate = self.sample_rate.unwrap_or(48_000);
        let channels = self.channels.unwrap_or(2);
        let audio_specific_config = aac::audio_specific_config(
            1, // AAC-LC; this crate doesn't remux HE-AAC/SBR streams (Non-goal)
            sample_rate_index(sample_rate),
            channels,
        );
        Ok(AudioTrack {
            info: AudioTrackInfo {
                sample_rate,
                channels,
                audio_specific_config,
            },
            samples: self.samples,
            edit_list: None,
        })
    }
}

fn sample_rate_index(rate: u32) -> u8 {
    (0..13)
        .find(|&i| aac::sample_rate_for_index(i) == Some(rate))
        .unwrap_or(3) // 48000
}

fn parse_config_and_split(frame: &[u8]) -> Result<(u8, u8, &[u8]), base::Error> {
    let (sfi, channels) = aac::parse_latm_stream_mux_config(frame)?;
    let mut r = BitReader::new(frame);
    let _ = r.read_bits(2); // audioMuxVersion + allStreamsSameTimeFraming
    r.skip_bits(6 + 4 + 3 + 5 + 4 + 4); // numSubFrames..channelConfiguration
    Ok((sfi, channels, &frame[r.byte_pos()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adts_pes(frames: &[&[u8]], sfi: u8, channels: u8) -> PesPacket {
        let mut payload = Vec::new();
        for f in frames {
            let frame_length = 7 + f.len();
            let mut out = vec![0u8; 7];
            out[0] = 0xff;
            out[1] = 0xf1;
            out[2] = (1 << 6) | (sfi << 2) | (channels >> 2);
            out[3] = ((channels & 0x03) << 6) | ((frame_length >> 11) as u8 & 0x03);
            out[4] = (frame_length >> 3) as u8;
            out[5] = (((frame_length & 0x07) as u8) << 5) | 0x1f;
            out[6] = 0xfc;
            out.extend_from_slice(f);
            payload.extend_from_slice(&out);
        }
        PesPacket {
            pts: Some(1000),
            dts: Some(1000),
            payload,
        }
    }

    fn raw_adts_frame(sfi: u8, channels: u8, payload: &[u8]) -> Vec<u8> {
        let frame_length = 7 + payload.len();
        let mut out = vec![0u8; 7];
        out[0] = 0xff;
        out[1] = 0xf1;
        out[2] = (1 << 6) | (sfi << 2) | (channels >> 2);
        out[3] = ((channels & 0x03) << 6) | ((frame_length >> 11) as u8 & 0x03);
        out[4] = (frame_length >> 3) as u8;
        out[5] = (((frame_length & 0x07) as u8) << 5) | 0x1f;
        out[6] = 0xfc;
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn trailing_partial_adts_frame_is_reassembled_from_the_next_pes() {
        let frame = raw_adts_frame(3, 2, &[0xAA, 0xBB, 0xCC]);
        let split = 5; // header is 7 bytes; split mid-header
        let first = PesPacket {
            pts: Some(1000),
            dts: Some(1000),
            payload: frame[..split].to_vec(),
        };
        let second = PesPacket {
            pts: Some(1000 + 1024 * 90_000 / 48_000),
            dts: Some(1000 + 1024 * 90_000 / 48_000),
            payload: frame[split..].to_vec(),
        };
        let mut acc = AudioAccumulator::new(AudioFraming::Adts);
        acc.push_pes(first).unwrap();
        acc.push_pes(second).unwrap();
        let track = acc.into_track().unwrap();
        assert_eq!(track.samples.len(), 1);
        assert_eq!(track.samples[0].data, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn adts_accumulator_assigns_increasing_pts() {
        let pes = adts_pes(&[&[0x01], &[0x02]], 3, 2); // 48kHz stereo
        let mut acc = AudioAccumulator::new(AudioFraming::Adts);
        acc.push_pes(pes).unwrap();
        let track = acc.into_track().unwrap();
        assert_eq!(track.samples.len(), 2);
        assert_eq!(track.samples[0].pts, 1000);
        assert_eq!(track.samples[1].pts, 1000 + 1024 * 90_000 / 48_000);
        assert_eq!(track.info.sample_rate, 48_000);
    }

    #[test]
    fn pes_without_pts_carries_forward_the_running_timestamp() {
        let first = adts_pes(&[&[0x01]], 3, 2);
        let mut second = adts_pes(&[&[0x02]], 3, 2);
        second.pts = None;
        second.dts = None;
        let mut acc = AudioAccumulator::new(AudioFraming::Adts);
        acc.push_pes(first).unwrap();
        acc.push_pes(second).unwrap();
        let track = acc.into_track().unwrap();
        assert_eq!(track.samples.len(), 2);
        assert_eq!(track.samples[1].pts, 1000 + 1024 * 90_000 / 48_000);
    }

    #[test]
    fn pes_without_pts_is_dropped_before_any_running_timestamp_exists() {
        let mut pes = adts_pes(&[&[0x01]], 3, 2);
        pes.pts = None;
        pes.dts = None;
        let mut acc = AudioAccumulator::new(AudioFraming::Adts);
        acc.push_pes(pes).unwrap();
        assert!(acc.into_track().is_err());
    }
}
