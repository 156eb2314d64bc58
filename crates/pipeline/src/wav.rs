//! RIFF/WAVE encoding for the uncompressed-audio path. Little-endian
//! throughout: `RIFF` + size, `WAVE`, a 16-byte `fmt ` chunk (tag 1 for
//! integer PCM, tag 3 for float), then the `data` chunk. Samples are clamped
//! into the signed range for 16/24-bit and stored as raw f32 for 32-bit.

use crate::error::{ErrorCode, ExportError};
use crate::frame::PcmBuffer;
use crate::progress::ExportPhase;

const FORMAT_PCM: u16 = 1;
const FORMAT_FLOAT: u16 = 3;

pub fn encode_wav(pcm: &PcmBuffer, bit_depth: u16) -> Result<Vec<u8>, ExportError> {
    if ![16, 24, 32].contains(&bit_depth) {
        return Err(ExportError::new(
            ErrorCode::AudioEncodeFailed,
            ExportPhase::Encoding,
            format!("unsupported wav bit depth: {bit_depth}"),
        ));
    }

    let bytes_per_sample = (bit_depth / 8) as u32;
    let block_align = pcm.channels * bytes_per_sample;
    let byte_rate = pcm.sample_rate * block_align;
    let data_len = pcm.samples.len() as u32 * bytes_per_sample;
    let format_tag = if bit_depth == 32 { FORMAT_FLOAT } else { FORMAT_PCM };

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&format_tag.to_le_bytes());
    out.extend_from_slice(&(pcm.channels as u16).to_le_bytes());
    out.extend_from_slice(&pcm.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&(block_align as u16).to_le_bytes());
    out.extend_from_slice(&bit_depth.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    match bit_depth {
        16 => {
            for s in &pcm.samples {
                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        24 => {
            for s in &pcm.samples {
                let v = (s.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                out.extend_from_slice(&v.to_le_bytes()[..3]);
            }
        }
        _ => {
            for s in &pcm.samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }

    Ok(out)
}

/// Parsed WAV header, as much as the tests and the audio path need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bit_depth: u16,
    pub data_len: u32,
}

pub fn parse_wav_header(bytes: &[u8]) -> Result<WavHeader, ExportError> {
    let bad = |msg: &str| {
        ExportError::new(
            ErrorCode::AudioEncodeFailed,
            ExportPhase::Encoding,
            format!("malformed wav: {msg}"),
        )
    };
    if bytes.len() < 44 {
        return Err(bad("truncated header"));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(bad("missing RIFF/WAVE magic"));
    }
    if &bytes[12..16] != b"fmt " {
        return Err(bad("missing fmt chunk"));
    }
    let u16le = |off: usize| u16::from_le_bytes([bytes[off], bytes[off + 1]]);
    let u32le = |off: usize| {
        u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
    };
    if &bytes[36..40] != b"data" {
        return Err(bad("missing data chunk"));
    }
    Ok(WavHeader {
        format_tag: u16le(20),
        channels: u16le(22),
        sample_rate: u32le(24),
        byte_rate: u32le(28),
        block_align: u16le(32),
        bit_depth: u16le(34),
        data_len: u32le(40),
    })
}

/// Decode the data chunk back to f32 samples (used by round-trip tests and
/// the audio-only export verification path).
pub fn decode_wav(bytes: &[u8]) -> Result<(WavHeader, Vec<f32>), ExportError> {
    let header = parse_wav_header(bytes)?;
    let data_end = 44usize
        .checked_add(header.data_len as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            ExportError::new(
                ErrorCode::AudioEncodeFailed,
                ExportPhase::Encoding,
                "malformed wav: data chunk exceeds buffer",
            )
        })?;
    let data = &bytes[44..data_end];
    let samples = match (header.format_tag, header.bit_depth) {
        (FORMAT_PCM, 16) => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
            .collect(),
        (FORMAT_PCM, 24) => data
            .chunks_exact(3)
            .map(|c| {
                let raw = i32::from_le_bytes([c[0], c[1], c[2], if c[2] & 0x80 != 0 { 0xFF } else { 0 }]);
                raw as f32 / 8_388_607.0
            })
            .collect(),
        (FORMAT_FLOAT, 32) => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        (tag, depth) => {
            return Err(ExportError::new(
                ErrorCode::AudioEncodeFailed,
                ExportPhase::Encoding,
                format!("unsupported wav layout: tag {tag}, {depth}-bit"),
            ))
        }
    };
    Ok((header, samples))
}
