// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Writes a non-fragmented, seekable ISO-BMFF (`.mp4`) file out of a
//! [`crate::model::Movie`]: `ftyp` + `moov` + one `mdat` holding every
//! sample back to back.
//!
//! Uses a two-pass layout: each track's `stco` is written first with
//! zeroed offsets, alongside a record of where those slots live relative to
//! that track's own `trak` body. Once `moov`'s total byte length is known —
//! and so is `mdat`'s start — every slot is patched with its real file
//! offset. This avoids serializing `moov` twice.

use crate::h264;
use crate::hevc;
use crate::model::{AudioTrack, EditListEntry, Movie, VideoCodec, VideoParameterSets, VideoTrack, MOVIE_TIMESCALE};
use base::bail_t;
use base::bitstream::{write_fourcc, write_i32, write_u16, write_u24, write_u32, write_u64};

fn box_with<F: FnOnce(&mut Vec<u8>)>(out: &mut Vec<u8>, fcc: &[u8; 4], f: F) {
    let start = out.len();
    write_u32(out, 0);
    write_fourcc(out, fcc);
    f(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn full_box_header(out: &mut Vec<u8>, version: u8, flags: u32) {
    out.push(version);
    write_u24(out, flags);
}

fn unity_matrix(out: &mut Vec<u8>) {
    for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        write_i32(out, v);
    }
}

/// A `stco` slot needing a real file offset once `mdat`'s start is known,
/// recorded as a byte position relative to the start of its track's `trak`
/// body (i.e. the `Vec<u8>` [`write_video_trak`]/[`write_audio_trak`]
/// return), plus the offset that sample has within `mdat`.
type StcoSlot = (usize, u64);

/// `tkhd.track_ID` conventionally starts at 256 for video and 257 for
/// audio, distinct from the low small integers `mvhd.next_track_ID` uses.
const VIDEO_TRACK_ID: u32 = 256;
const AUDIO_TRACK_ID: u32 = 257;

/// Writes `movie` as a complete, non-fragmented `.mp4` file.
pub fn write(movie: &Movie) -> Result<Vec<u8>, base::Error> {
    if movie.video.is_none() && movie.audio.is_none() {
        bail_t!(InvalidArgument, "movie has neither a video nor an audio track");
    }

    let mut mdat_payload = Vec::new();
    if let Some(v) = &movie.video {
        for s in &v.samples {
            mdat_payload.extend_from_slice(&s.data);
        }
    }
    let audio_mdat_offset = mdat_payload.len() as u64;
    if let Some(a) = &movie.audio {
        for s in &a.samples {
            mdat_payload.extend_from_slice(&s.data);
        }
    }

    let mut ftyp = Vec::new();
    write_ftyp(&mut ftyp);

    let duration = movie.duration();
    let track_count = movie.video.is_some() as u32 + movie.audio.is_some() as u32;
    let mut moov_body = Vec::new();
    box_with(&mut moov_body, b"mvhd", |out| write_mvhd(out, duration, track_count + 1));

    let mut slots: Vec<StcoSlot> = Vec::new();
    if let Some(v) = &movie.video {
        let (trak, track_slots) = write_video_trak(v, VIDEO_TRACK_ID, 0)?;
        embed_trak(&mut moov_body, &mut slots, trak, track_slots);
    }
    if let Some(a) = &movie.audio {
        let (trak, track_slots) = write_audio_trak(a, AUDIO_TRACK_ID, audio_mdat_offset)?;
        embed_trak(&mut moov_body, &mut slots, trak, track_slots);
    }

    let mut moov = Vec::new();
    box_with(&mut moov, b"moov", |out| out.extend_from_slice(&moov_body));
    // Every slot so far is relative to moov_body; box_with above prefixed it
    // with an 8-byte header (size + 'moov'), so shift by that once more.
    for slot in &mut slots {
        slot.0 += 8;
    }

    let mdat_start = ftyp.len() as u64 + moov.len() as u64 + 8;
    for &(position, local_offset) in &slots {
        let abs = mdat_start + local_offset;
        if abs > u32::MAX as u64 {
            bail_t!(
                OutOfBounds,
                "mdat offset {} exceeds the 32-bit stco offset space",
                abs
            );
        }
        moov[position..position + 4].copy_from_slice(&(abs as u32).to_be_bytes());
    }

    let mut out = ftyp;
    out.extend_from_slice(&moov);
    box_with(&mut out, b"mdat", |out| out.extend_from_slice(&mdat_payload));
    Ok(out)
}

/// Wraps `trak_body` in a `trak` box and appends it to `moov_body`,
/// translating `track_slots` (relative to `trak_body`) into positions
/// relative to `moov_body`.
fn embed_trak(moov_body: &mut Vec<u8>, out_slots: &mut Vec<StcoSlot>, trak_body: Vec<u8>, track_slots: Vec<StcoSlot>) {
    let trak_start = moov_body.len() + 8; // + the trak box header box_with is about to write
    box_with(moov_body, b"trak", |out| out.extend_from_slice(&trak_body));
    for (position, local_offset) in track_slots {
        out_slots.push((trak_start + position, local_offset));
    }
}

fn write_ftyp(out: &mut Vec<u8>) {
    box_with(out, b"ftyp", |out| {
        write_fourcc(out, b"isom");
        write_u32(out, 1);
        write_fourcc(out, b"isom");
        write_fourcc(out, b"avc1");
    });
}

fn write_mvhd(out: &mut Vec<u8>, duration: i64, next_track_id: u32) {
    full_box_header(out, 0, 0);
    write_u32(out, 0); // creation_time
    write_u32(out, 0); // modification_time
    write_u32(out, MOVIE_TIMESCALE);
    write_u32(out, duration.max(0) as u32);
    write_u32(out, 0x0001_0000); // rate, 1.0
    write_u16(out, 0x0100); // volume, 1.0
    write_u16(out, 0); // reserved
    write_u32(out, 0);
    write_u32(out, 0);
    unity_matrix(out);
    for _ in 0..6 {
        write_u32(out, 0); // pre_defined
    }
    write_u32(out, next_track_id);
}

fn write_tkhd(out: &mut Vec<u8>, track_id: u32, duration: i64, width: u16, height: u16, is_audio: bool) {
    full_box_header(out, 0, 0x7); // enabled | in_movie | in_preview
    write_u32(out, 0); // creation_time
    write_u32(out, 0); // modification_time
    write_u32(out, track_id);
    write_u32(out, 0); // reserved
    write_u32(out, duration.max(0) as u32);
    write_u32(out, 0); // reserved[2]
    write_u32(out, 0);
    write_u16(out, 0); // layer
    write_u16(out, if is_audio { 1 } else { 0 }); // alternate_group
    write_u16(out, if is_audio { 0x0100 } else { 0 }); // volume
    write_u16(out, 0); // reserved
    unity_matrix(out);
    write_u32(out, (width as u32) << 16);
    write_u32(out, (height as u32) << 16);
}

fn write_elst(out: &mut Vec<u8>, edit: &EditListEntry) {
    box_with(out, b"edts", |out| {
        box_with(out, b"elst", |out| {
            full_box_header(out, 1, 0);
            write_u32(out, 1); // entry_count
            write_u64(out, edit.segment_duration);
            write_u64(out, edit.media_time as u64);
            write_u16(out, 1); // media_rate_integer
            write_u16(out, 0); // media_rate_fraction
        });
    });
}

/// One duration per sample, run-length encoded into `(sample_count,
/// sample_delta)` pairs for `stts`.
fn write_stts(out: &mut Vec<u8>, deltas: &[u32]) {
    box_with(out, b"stts", |out| {
        full_box_header(out, 0, 0);
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for &d in deltas {
            match runs.last_mut() {
                Some((count, delta)) if *delta == d => *count += 1,
                _ => runs.push((1, d)),
            }
        }
        write_u32(out, runs.len() as u32);
        for (count, delta) in runs {
            write_u32(out, count);
            write_u32(out, delta);
        }
    });
}

/// Per-sample DTS deltas, with the final sample repeating the prior delta
/// (there is no following sample to measure it against).
fn sample_deltas(timestamps: &[i64]) -> Vec<u32> {
    match timestamps.len() {
        0 => vec![],
        1 => vec![1],
        n => {
            let mut deltas: Vec<u32> = (0..n - 1)
                .map(|i| (timestamps[i + 1] - timestamps[i]).max(1) as u32)
                .collect();
            deltas.push(*deltas.last().unwrap());
            deltas
        }
    }
}

/// Per-sample audio deltas in the track's own media timescale: each is
/// `round((pts[i+1] - pts[i]) * timescale / 90000)`, clamped to `(0,
/// 2*1024]` — anything outside that range (a PTS discontinuity, a
/// stitched-in gap) falls back to the nominal 1024-sample AAC frame
/// duration rather than propagating a bogus delta into `stts`. The final
/// sample repeats the prior delta, same as the video table.
fn audio_sample_deltas(pts: &[i64], timescale: u32) -> Vec<u32> {
    const NOMINAL: u32 = 1024;
    match pts.len() {
        0 => vec![],
        1 => vec![NOMINAL],
        n => {
            let mut deltas: Vec<u32> = (0..n - 1)
                .map(|i| {
                    let ticks = pts[i + 1] - pts[i];
                    let scaled = (ticks as i128 * timescale as i128 + MOVIE_TIMESCALE as i128 / 2)
                        / MOVIE_TIMESCALE as i128;
                    if scaled > 0 && scaled <= 2 * NOMINAL as i128 {
                        scaled as u32
                    } else {
                        NOMINAL
                    }
                })
                .collect();
            deltas.push(*deltas.last().unwrap());
            deltas
        }
    }
}

fn write_ctts(out: &mut Vec<u8>, offsets: &[i32]) {
    box_with(out, b"ctts", |out| {
        full_box_header(out, 0, 0);
        let mut runs: Vec<(u32, i32)> = Vec::new();
        for &o in offsets {
            match runs.last_mut() {
                Some((count, v)) if *v == o => *count += 1,
                _ => runs.push((1, o)),
            }
        }
        write_u32(out, runs.len() as u32);
        for (count, offset) in runs {
            write_u32(out, count);
            write_u32(out, offset as u32);
        }
    });
}

fn write_stss(out: &mut Vec<u8>, keyframe_sample_numbers: &[u32]) {
    box_with(out, b"stss", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, keyframe_sample_numbers.len() as u32);
        for n in keyframe_sample_numbers {
            write_u32(out, *n);
        }
    });
}

/// All of a track's samples live in a single chunk, so `stsc` needs only one
/// run: chunk 1 holds every sample.
fn write_stsc(out: &mut Vec<u8>, sample_count: u32) {
    box_with(out, b"stsc", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, if sample_count == 0 { 0 } else { 1 });
        if sample_count > 0 {
            write_u32(out, 1); // first_chunk
            write_u32(out, sample_count); // samples_per_chunk
            write_u32(out, 1); // sample_description_index
        }
    });
}

fn write_stsz(out: &mut Vec<u8>, sizes: &[u32]) {
    box_with(out, b"stsz", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, 0); // sample_size == 0 means "sizes follow per-sample"
        write_u32(out, sizes.len() as u32);
        for s in sizes {
            write_u32(out, *s);
        }
    });
}

/// Writes `stco` with a single zeroed offset for the track's one chunk,
/// recording its position (relative to the start of `out`) alongside the
/// chunk's offset within `mdat`, so [`write`] can patch in the real file
/// offset once known. `sample_count` of 0 writes an empty table.
fn write_stco_placeholder(out: &mut Vec<u8>, slots: &mut Vec<StcoSlot>, mdat_offset: u64, sample_count: usize) {
    box_with(out, b"stco", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, if sample_count == 0 { 0 } else { 1 });
        if sample_count > 0 {
            slots.push((out.len(), mdat_offset));
            write_u32(out, 0);
        }
    });
}

fn write_video_trak(
    track: &VideoTrack,
    track_id: u32,
    mdat_offset: u64,
) -> Result<(Vec<u8>, Vec<StcoSlot>), base::Error> {
    if track.samples.is_empty() {
        bail_t!(EmptyStream, "video track has no samples to write");
    }
    let duration = track.duration();
    let mut out = Vec::new();
    box_with(&mut out, b"tkhd", |out| {
        write_tkhd(out, track_id, duration, track.info.width, track.info.height, false)
    });
    if let Some(edit) = &track.edit_list {
        write_elst(&mut out, edit);
    }

    let mut mdia = Vec::new();
    box_with(&mut mdia, b"mdhd", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, 0);
        write_u32(out, 0);
        write_u32(out, MOVIE_TIMESCALE);
        write_u32(out, duration.max(0) as u32);
        write_u16(out, 0x55c4); // und
        write_u16(out, 0);
    });
    box_with(&mut mdia, b"hdlr", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, 0);
        write_fourcc(out, b"vide");
        write_u32(out, 0);
        write_u32(out, 0);
        write_u32(out, 0);
        out.extend_from_slice(b"VideoHandler\0");
    });

    let mut minf = Vec::new();
    box_with(&mut minf, b"vmhd", |out| {
        full_box_header(out, 0, 1);
        write_u16(out, 0); // graphicsmode
        for _ in 0..3 {
            write_u16(out, 0); // opcolor
        }
    });
    write_dinf(&mut minf);

    let mut stbl = Vec::new();
    let sample_entry = video_sample_entry(&track.info.parameter_sets, track.info.width, track.info.height);
    box_with(&mut stbl, b"stsd", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, 1);
        out.extend_from_slice(&sample_entry);
    });

    let dts: Vec<i64> = track.samples.iter().map(|s| s.dts).collect();
    write_stts(&mut stbl, &sample_deltas(&dts));

    let offsets: Vec<i32> = track.samples.iter().map(|s| (s.pts - s.dts) as i32).collect();
    if offsets.iter().any(|&o| o != 0) {
        write_ctts(&mut stbl, &offsets);
    }

    let keyframes: Vec<u32> = track
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_keyframe)
        .map(|(i, _)| (i + 1) as u32)
        .collect();
    if !keyframes.is_empty() {
        write_stss(&mut stbl, &keyframes);
    }
    write_stsc(&mut stbl, track.samples.len() as u32);
    let sizes: Vec<u32> = track.samples.iter().map(|s| s.data.len() as u32).collect();
    write_stsz(&mut stbl, &sizes);

    let mut slots = Vec::new();
    write_stco_placeholder(&mut stbl, &mut slots, mdat_offset, track.samples.len());

    box_with(&mut minf, b"stbl", |out| out.extend_from_slice(&stbl));
    box_with(&mut mdia, b"minf", |out| out.extend_from_slice(&minf));
    let mdia_start = out.len() + 8;
    box_with(&mut out, b"mdia", |out| out.extend_from_slice(&mdia));
    for (position, _) in &mut slots {
        *position += mdia_start;
    }
    Ok((out, slots))
}

fn write_dinf(out: &mut Vec<u8>) {
    box_with(out, b"dinf", |out| {
        box_with(out, b"dref", |out| {
            full_box_header(out, 0, 0);
            write_u32(out, 1);
            box_with(out, b"url ", |out| full_box_header(out, 0, 1));
        });
    });
}

fn video_sample_entry(parameter_sets: &VideoParameterSets, width: u16, height: u16) -> Vec<u8> {
    let fcc: &[u8; 4] = match parameter_sets {
        VideoParameterSets::Avc(_) => b"avc1",
        VideoParameterSets::Hevc(_) => b"hvc1",
    };
    let mut out = Vec::new();
    box_with(&mut out, fcc, |out| {
        out.extend_from_slice(&[0u8; 6]); // reserved
        write_u16(out, 1); // data_reference_index
        write_u16(out, 0); // pre_defined
        write_u16(out, 0); // reserved
        for _ in 0..3 {
            write_u32(out, 0); // pre_defined
        }
        write_u16(out, width);
        write_u16(out, height);
        write_u32(out, 0x0048_0000); // horizresolution, 72 dpi
        write_u32(out, 0x0048_0000); // vertresolution, 72 dpi
        write_u32(out, 0); // reserved
        write_u16(out, 1); // frame_count
        out.extend_from_slice(&[0u8; 32]); // compressorname
        write_u16(out, 0x0018); // depth
        out.extend_from_slice(&[0xff, 0xff]); // pre_defined = -1
        match parameter_sets {
            VideoParameterSets::Avc(p) => {
                box_with(out, b"avcC", |out| out.extend_from_slice(&h264::avc_decoder_config_record(p)));
            }
            VideoParameterSets::Hevc(p) => {
                box_with(out, b"hvcC", |out| out.extend_from_slice(&hevc::hevc_decoder_config_record(p)));
            }
        }
    });
    out
}

fn write_audio_trak(
    track: &AudioTrack,
    track_id: u32,
    mdat_offset: u64,
) -> Result<(Vec<u8>, Vec<StcoSlot>), base::Error> {
    if track.samples.is_empty() {
        bail_t!(EmptyStream, "audio track has no samples to write");
    }
    let timescale = track.info.sample_rate;
    let pts: Vec<i64> = track.samples.iter().map(|s| s.pts).collect();
    let deltas = audio_sample_deltas(&pts, timescale);
    let duration_in_media_ts: i64 = deltas.iter().map(|&d| d as i64).sum();
    let duration_in_movie_ts = duration_in_media_ts * MOVIE_TIMESCALE as i64 / timescale as i64;

    let mut out = Vec::new();
    box_with(&mut out, b"tkhd", |out| write_tkhd(out, track_id, duration_in_movie_ts, 0, 0, true));
    if let Some(edit) = &track.edit_list {
        write_elst(&mut out, edit);
    }

    let mut mdia = Vec::new();
    box_with(&mut mdia, b"mdhd", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, 0);
        write_u32(out, 0);
        write_u32(out, timescale);
        write_u32(out, duration_in_media_ts.max(0) as u32);
        write_u16(out, 0x55c4);
        write_u16(out, 0);
    });
    box_with(&mut mdia, b"hdlr", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, 0);
        write_fourcc(out, b"soun");
        write_u32(out, 0);
        write_u32(out, 0);
        write_u32(out, 0);
        out.extend_from_slice(b"SoundHandler\0");
    });

    let mut minf = Vec::new();
    box_with(&mut minf, b"smhd", |out| {
        full_box_header(out, 0, 0);
        write_u16(out, 0); // balance
        write_u16(out, 0); // reserved
    });
    write_dinf(&mut minf);

    let mut stbl = Vec::new();
    let sample_entry = audio_sample_entry(track.info.channels, &track.info.audio_specific_config, timescale);
    box_with(&mut stbl, b"stsd", |out| {
        full_box_header(out, 0, 0);
        write_u32(out, 1);
        out.extend_from_slice(&sample_entry);
    });

    write_stts(&mut stbl, &deltas);
    write_stsc(&mut stbl, track.samples.len() as u32);
    let sizes: Vec<u32> = track.samples.iter().map(|s| s.data.len() as u32).collect();
    write_stsz(&mut stbl, &sizes);

    let mut slots = Vec::new();
    write_stco_placeholder(&mut stbl, &mut slots, mdat_offset, track.samples.len());

    box_with(&mut minf, b"stbl", |out| out.extend_from_slice(&stbl));
    box_with(&mut mdia, b"minf", |out| out.extend_from_slice(&minf));
    let mdia_start = out.len() + 8;
    box_with(&mut out, b"mdia", |out| out.extend_from_slice(&mdia));
    for (position, _) in &mut slots {
        *position += mdia_start;
    }
    Ok((out, slots))
}

fn audio_sample_entry(channels: u8, audio_specific_config: &[u8], timescale: u32) -> Vec<u8> {
    let mut out = Vec::new();
    box_with(&mut out, b"mp4a", |out| {
        out.extend_from_slice(&[0u8; 6]); // reserved
        write_u16(out, 1); // data_reference_index
        write_u32(out, 0); // reserved
        write_u32(out, 0);
        write_u16(out, channels as u16);
        write_u16(out, 16); // samplesize
        write_u16(out, 0); // pre_defined
        write_u16(out, 0); // reserved
        write_u32(out, timescale << 16);
        box_with(out, b"esds", |out| {
            full_box_header(out, 0, 0);
            write_es_descriptor(out, audio_specific_config);
        });
    });
    out
}

/// Wraps a raw `AudioSpecificConfig` in the minimal `ES_Descriptor` /
/// `DecoderConfigDescriptor` / `DecSpecificInfo` / `SLConfigDescriptor`
/// chain a player expects inside `esds` (ISO/IEC 14496-1 §7.2.2.2).
fn write_es_descriptor(out: &mut Vec<u8>, audio_specific_config: &[u8]) {
    fn descriptor(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
        out.push(tag);
        out.push(body.len() as u8); // every body written here fits in 7 bits
        out.extend_from_slice(body);
    }

    let mut dec_specific_info = Vec::new();
    descriptor(&mut dec_specific_info, 0x05, audio_specific_config);

    let mut decoder_config_body = vec![0x40, 0x15]; // objectTypeIndication=AAC, streamType=audio
    decoder_config_body.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    decoder_config_body.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
    decoder_config_body.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate
    decoder_config_body.extend_from_slice(&dec_specific_info);
    let mut decoder_config = Vec::new();
    descriptor(&mut decoder_config, 0x04, &decoder_config_body);

    let mut sl_config = Vec::new();
    descriptor(&mut sl_config, 0x06, &[0x02]); // predefined=2 (MP4 files)

    let mut es_body = vec![0, 0, 0]; // ES_ID, flags
    es_body.extend_from_slice(&decoder_config);
    es_body.extend_from_slice(&sl_config);
    descriptor(out, 0x03, &es_body);
}
