//! Minimal RIFF/AVI muxer for MJPEG streams.
//!
//! Layout written:
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl'  avih  LIST 'strl' (strh strf)
//!   LIST 'movi'  00dc * n
//!   idx1
//! ```
//!
//! Every frame is a keyframe. All sizes are little-endian u32 and chunks are
//! padded to even length. Clips whose RIFF size would not fit in 32 bits are
//! rejected with `InvalidInput` before anything is written.

use std::io::{self, Write};

use crate::recorder::JpegFrame;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const AVIH_LEN: u32 = 56;
const STRH_LEN: u32 = 56;
const STRF_LEN: u32 = 40;
const RATE_SCALE: u32 = 1000;

/// Header fields read back from an MJPEG AVI.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AviInfo {
    pub total_frames: u32,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl AviInfo {
    pub fn duration_secs(&self) -> f64 {
        if self.fps <= 0.0 {
            return 0.0;
        }
        self.total_frames as f64 / self.fps
    }
}

fn padded(len: usize) -> u64 {
    len as u64 + (len as u64 & 1)
}

fn fit_u32(value: u64, what: &str) -> io::Result<u32> {
    u32::try_from(value).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} of {} bytes exceeds the 4 GiB AVI limit", what, value),
        )
    })
}

pub fn write_mjpeg_avi<W: Write>(
    out: &mut W,
    frames: &[JpegFrame],
    width: u32,
    height: u32,
    fps: f64,
) -> io::Result<()> {
    let rate = (fps * RATE_SCALE as f64).round().max(1.0) as u32;
    let usec_per_frame = (1_000_000.0 / fps).round() as u32;
    let max_frame = fit_u32(
        frames.iter().map(|f| f.len() as u64).max().unwrap_or(0),
        "frame",
    )?;
    let n = fit_u32(frames.len() as u64, "frame count")?;

    let strl_len = 4 + (8 + STRH_LEN) + (8 + STRF_LEN);
    let hdrl_len = 4 + (8 + AVIH_LEN) + (8 + strl_len);
    let movi_payload: u64 = frames.iter().map(|f| 8 + padded(f.len())).sum();
    let movi_len = 4 + movi_payload;
    let idx_len = 16 * n as u64;
    let riff_len = fit_u32(
        4 + (8 + hdrl_len as u64) + (8 + movi_len) + (8 + idx_len),
        "clip",
    )?;
    // every inner size is bounded by the riff size
    let movi_len = movi_len as u32;
    let idx_len = idx_len as u32;

    out.write_all(b"RIFF")?;
    put_u32(out, riff_len)?;
    out.write_all(b"AVI ")?;

    out.write_all(b"LIST")?;
    put_u32(out, hdrl_len)?;
    out.write_all(b"hdrl")?;

    out.write_all(b"avih")?;
    put_u32(out, AVIH_LEN)?;
    put_u32(out, usec_per_frame)?;
    put_u32(out, (max_frame as f64 * fps).round() as u32)?;
    put_u32(out, 0)?; // padding granularity
    put_u32(out, AVIF_HASINDEX)?;
    put_u32(out, n)?;
    put_u32(out, 0)?; // initial frames
    put_u32(out, 1)?; // streams
    put_u32(out, max_frame)?;
    put_u32(out, width)?;
    put_u32(out, height)?;
    for _ in 0..4 {
        put_u32(out, 0)?;
    }

    out.write_all(b"LIST")?;
    put_u32(out, strl_len)?;
    out.write_all(b"strl")?;

    out.write_all(b"strh")?;
    put_u32(out, STRH_LEN)?;
    out.write_all(b"vids")?;
    out.write_all(b"MJPG")?;
    put_u32(out, 0)?; // flags
    put_u16(out, 0)?; // priority
    put_u16(out, 0)?; // language
    put_u32(out, 0)?; // initial frames
    put_u32(out, RATE_SCALE)?;
    put_u32(out, rate)?;
    put_u32(out, 0)?; // start
    put_u32(out, n)?;
    put_u32(out, max_frame)?;
    put_u32(out, u32::MAX)?; // quality: default
    put_u32(out, 0)?; // sample size
    put_u16(out, 0)?;
    put_u16(out, 0)?;
    put_u16(out, width.min(u16::MAX as u32) as u16)?;
    put_u16(out, height.min(u16::MAX as u32) as u16)?;

    out.write_all(b"strf")?;
    put_u32(out, STRF_LEN)?;
    put_u32(out, STRF_LEN)?;
    put_u32(out, width)?;
    put_u32(out, height)?;
    put_u16(out, 1)?; // planes
    put_u16(out, 24)?; // bit count
    out.write_all(b"MJPG")?;
    put_u32(out, width.saturating_mul(height).saturating_mul(3))?;
    for _ in 0..4 {
        put_u32(out, 0)?;
    }

    out.write_all(b"LIST")?;
    put_u32(out, movi_len)?;
    out.write_all(b"movi")?;
    for frame in frames {
        out.write_all(b"00dc")?;
        put_u32(out, frame.len() as u32)?;
        out.write_all(frame)?;
        if frame.len() & 1 == 1 {
            out.write_all(&[0])?;
        }
    }

    out.write_all(b"idx1")?;
    put_u32(out, idx_len)?;
    // offsets are relative to the 'movi' fourcc
    let mut offset = 4u32;
    for frame in frames {
        out.write_all(b"00dc")?;
        put_u32(out, AVIIF_KEYFRAME)?;
        put_u32(out, offset)?;
        put_u32(out, frame.len() as u32)?;
        offset += 8 + padded(frame.len()) as u32;
    }
    out.flush()
}

/// Reads the main and stream headers of an AVI written by `write_mjpeg_avi`.
pub fn probe(bytes: &[u8]) -> Option<AviInfo> {
    if bytes.get(0..4)? != b"RIFF" || bytes.get(8..12)? != b"AVI " {
        return None;
    }
    // RIFF header (12) + LIST hdrl header (12) + avih chunk header (8)
    let avih = 32;
    if bytes.get(24..28)? != b"avih" {
        return None;
    }
    let total_frames = read_u32(bytes, avih + 16)?;
    let width = read_u32(bytes, avih + 32)?;
    let height = read_u32(bytes, avih + 36)?;
    // avih body (56) + LIST strl header (12) + strh chunk header (8)
    let strh = avih + AVIH_LEN as usize + 20;
    let scale = read_u32(bytes, strh + 20)?;
    let rate = read_u32(bytes, strh + 24)?;
    let fps = if scale == 0 {
        0.0
    } else {
        rate as f64 / scale as f64
    };
    Some(AviInfo {
        total_frames,
        width,
        height,
        fps,
    })
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn put_u32<W: Write>(out: &mut W, v: u32) -> io::Result<()> {
    out.write_all(&v.to_le_bytes())
}

fn put_u16<W: Write>(out: &mut W, v: u16) -> io::Result<()> {
    out.write_all(&v.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frames(n: usize) -> Vec<JpegFrame> {
        // odd and even lengths to exercise padding
        (0..n)
            .map(|i| Arc::from(vec![0xFFu8, 0xD8, 0xAA, 0xFF, 0xD9, i as u8][..5 + i % 2].to_vec()))
            .collect()
    }

    #[test]
    fn riff_length_matches_file_size() {
        let mut buf = Vec::new();
        write_mjpeg_avi(&mut buf, &frames(7), 64, 48, 24.0).unwrap();
        let riff_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        assert_eq!(riff_len + 8, buf.len());
    }

    #[test]
    fn probe_reads_back_header() {
        let mut buf = Vec::new();
        write_mjpeg_avi(&mut buf, &frames(30), 1280, 720, 24.0).unwrap();
        let info = probe(&buf).unwrap();
        assert_eq!(info.total_frames, 30);
        assert_eq!((info.width, info.height), (1280, 720));
        assert!((info.fps - 24.0).abs() < 1e-9);
        assert!((info.duration_secs() - 1.25).abs() < 1e-9);
    }

    #[test]
    fn index_has_one_entry_per_frame() {
        let n = 5;
        let mut buf = Vec::new();
        write_mjpeg_avi(&mut buf, &frames(n), 8, 8, 10.0).unwrap();
        let idx = buf
            .windows(4)
            .rposition(|w| w == b"idx1")
            .expect("idx1 chunk");
        let len = u32::from_le_bytes([buf[idx + 4], buf[idx + 5], buf[idx + 6], buf[idx + 7]]);
        assert_eq!(len as usize, 16 * n);
        assert_eq!(idx + 8 + 16 * n, buf.len());
    }

    #[test]
    fn oversized_clip_is_rejected_before_writing() {
        let big: JpegFrame = Arc::from(vec![0u8; 1 << 20]);
        let frames = vec![big; 4200];
        let mut out = Vec::new();
        let err = write_mjpeg_avi(&mut out, &frames, 1280, 720, 24.0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(out.is_empty());
    }

    #[test]
    fn probe_rejects_other_files() {
        assert!(probe(b"not an avi file at all, clearly").is_none());
        assert!(probe(b"RIFF").is_none());
    }
}
