// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Accumulates one video elementary stream's PES packets into a `VideoTrack`:
//! NAL-scans each access unit, captures parameter sets the first time they
//! appear, and classifies keyframes.

use crate::h264;
use crate::hevc;
use crate::model::{AvcParameterSets, HevcParameterSets, VideoCodec, VideoParameterSets, VideoSample, VideoTrack, VideoTrackInfo};
use crate::ts::pes::PesPacket;
use base::bail_t;
use base::bitstream::{scan_nal_units, write_u32};

pub struct VideoAccumulator {
    codec: VideoCodec,
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    samples: Vec<VideoSample>,
}

impl VideoAccumulator {
    pub fn new(codec: VideoCodec) -> Self {
        VideoAccumulator {
            codec,
            vps: None,
            sps: None,
            pps: None,
            samples: Vec::new(),
        }
    }

    pub fn push_pes(&mut self, pes: PesPacket) -> Result<(), base::Error> {
        // A PES without a PTS is dropped; it can't be placed on a timeline,
        // and unlike audio there's no running timestamp to carry forward,
        // since video PTS is non-monotonic and B-frame reordering means
        // skipping one AU's timestamp can't be inferred from the last.
        let (pts, dts) = match (pes.pts, pes.dts) {
            (Some(pts), Some(dts)) => (pts, dts),
            _ => return Ok(()),
        };
        let mut nals: Vec<&[u8]> = Vec::new();
        scan_nal_units(&pes.payload, |n| nals.push(n));
        if nals.is_empty() {
            return Ok(()); // stuffing-only PES, not an error
        }

        let is_keyframe = match self.codec {
            VideoCodec::Avc => {
                for nal in &nals {
                    match h264::nal_unit_type(nal) {
                        h264::NAL_UNIT_SEQ_PARAMETER_SET if self.sps.is_none() => {
                            self.sps = Some(nal.to_vec())
                        }
                        h264::NAL_UNIT_PIC_PARAMETER_SET if self.pps.is_none() => {
                            self.pps = Some(nal.to_vec())
                        }
                        _ => {}
                    }
                }
                h264::is_keyframe(&nals)
            }
            VideoCodec::Hevc => {
                for nal in &nals {
                    let t = hevc::nal_unit_type(nal);
                    if hevc::is_parameter_set(t) {
                        match t {
                            32 if self.vps.is_none() => self.vps = Some(nal.to_vec()),
                            33 if self.sps.is_none() => self.sps = Some(nal.to_vec()),
                            34 if self.pps.is_none() => self.pps = Some(nal.to_vec()),
                            _ => {}
                        }
                    }
                }
                hevc::is_keyframe(&nals)
            }
        };

        let mut data = Vec::new();
        for nal in &nals {
            write_u32(&mut data, nal.len() as u32);
            data.extend_from_slice(nal);
        }
        self.samples.push(VideoSample {
            data,
            pts,
            dts,
            is_keyframe,
        });
        Ok(())
    }

    pub fn into_track(self) -> Result<VideoTrack, base::Error> {
        if self.samples.is_empty() {
            bail_t!(EmptyStream, "video PID produced zero access units");
        }
        let sps = self
            .sps
            .ok_or_else(|| base::format_err_t!(MalformedContainer, "no SPS found in video stream"))?;
        let pps = self
            .pps
            .ok_or_else(|| base::format_err_t!(MalformedContainer, "no PPS found in video stream"))?;

        let (parameter_sets, width, height) = match self.codec {
            VideoCodec::Avc => {
                let (w, h) = h264::parse_sps_dimensions(&sps)?;
                (
                    VideoParameterSets::Avc(AvcParameterSets { sps, pps }),
                    w,
                    h,
                )
            }
            VideoCodec::Hevc => {
                let vps = self.vps.ok_or_else(|| {
                    base::format_err_t!(MalformedContainer, "no VPS found in HEVC stream")
                })?;
                let (w, h) = hevc::parse_sps_dimensions(&sps)?;
                (
                    VideoParameterSets::Hevc(HevcParameterSets { vps, sps, pps }),
                    w,
                    h,
                )
            }
        };

        Ok(VideoTrack {
            info: VideoTrackInfo {
                codec: self.codec,
                width,
                height,
                parameter_sets,
            },
            samples: self.samples,
            edit_list: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn au_pes(nals: &[&[u8]], pts: i64) -> PesPacket {
        let mut payload = Vec::new();
        for nal in nals {
            payload.extend_from_slice(&[0, 0, 0, 1]);
            payload.extend_from_slice(nal);
        }
        PesPacket {
            pts: Some(pts),
            dts: Some(pts),
            payload,
        }
    }

    #[test]
    fn captures_sps_pps_and_classifies_keyframe() {
        let sps: &[u8] = &[
            0x67, 0x42, 0x00, 0x1f, 0x8d, 0x8d, 0x40, 0x50, 0x1e, 0xd0, 0x0f, 0x08, 0x84, 0x6a,
        ];
        let pps: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
        let idr: &[u8] = &[0x65, 0xAA];
        let mut acc = VideoAccumulator::new(VideoCodec::Avc);
        acc.push_pes(au_pes(&[sps, pps, idr], 0)).unwrap();
        let track = acc.into_track().unwrap();
        assert_eq!(track.samples.len(), 1);
        assert!(track.samples[0].is_keyframe);
        assert_eq!(track.info.width, 1280);
        assert_eq!(track.info.height, 720);
    }

    #[test]
    fn rejects_stream_with_no_sps() {
        let non_idr: &[u8] = &[0x41, 0xAA];
        let mut acc = VideoAccumulator::new(VideoCodec::Avc);
        acc.push_pes(au_pes(&[non_idr], 0)).unwrap();
        assert!(acc.into_track().is_err());
    }

    #[test]
    fn drops_pes_without_a_pts() {
        let idr: &[u8] = &[0x65, 0xAA];
        let mut pes = au_pes(&[idr], 0);
        pes.pts = None;
        pes.dts = None;
        let mut acc = VideoAccumulator::new(VideoCodec::Avc);
        acc.push_pes(pes).unwrap();
        assert!(acc.samples.is_empty());
    }
}
