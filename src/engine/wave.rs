//! WAVE file loading.
//!
//! A minimal RIFF chunk walker that hands the raw `data` payload and the
//! format descriptor to the PCM source. Sample decoding happens later, one
//! frame at a time, in [`decoders`](super::decoders); this module never
//! interprets audio bytes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::engine::errors::WaveError;

/// `WAVE_FORMAT_PCM`
pub(crate) const FORMAT_PCM: u16 = 0x0001;
/// `WAVE_FORMAT_IEEE_FLOAT`
pub(crate) const FORMAT_IEEE_FLOAT: u16 = 0x0003;
/// `WAVE_FORMAT_ALAW`
pub(crate) const FORMAT_ALAW: u16 = 0x0006;
/// `WAVE_FORMAT_MULAW`
pub(crate) const FORMAT_MULAW: u16 = 0x0007;
/// `WAVE_FORMAT_EXTENSIBLE`
pub(crate) const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Parsed WAVE file: format descriptor plus the raw sample bytes.
#[derive(Debug)]
pub(crate) struct WaveData {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Channel count as stored in the file.
    pub channels: u16,
    /// Bits per sample of one channel element.
    pub bits_per_sample: u16,
    /// Size in bytes of one frame across all channels.
    pub block_align: u16,
    /// Format tag; for EXTENSIBLE files this is already the resolved
    /// sub-format word.
    pub format_tag: u16,
    /// Raw contents of the `data` chunk.
    pub data: Vec<u8>,
}

/// Cheap check whether the file starts with the RIFF/WAVE magic.
pub(crate) fn sniff(path: &Path) -> bool {
    let mut header = [0u8; 12];
    match File::open(path) {
        Ok(mut file) => {
            file.read_exact(&mut header).is_ok()
                && &header[0..4] == b"RIFF"
                && &header[8..12] == b"WAVE"
        }
        Err(_) => false,
    }
}

/// Loads a WAVE file, walking its chunks until `fmt ` and `data` are found.
pub(crate) fn load(path: &Path) -> Result<WaveData, WaveError> {
    let mut file = File::open(path)?;

    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Err(WaveError::NotWave);
    }

    let mut fmt: Option<(u32, u16, u16, u16, u16)> = None;
    let mut data: Option<Vec<u8>> = None;

    let mut chunk_header = [0u8; 8];
    loop {
        match file.read_exact(&mut chunk_header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let id = [
            chunk_header[0],
            chunk_header[1],
            chunk_header[2],
            chunk_header[3],
        ];
        let size = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as usize;

        match &id {
            b"fmt " => {
                let mut body = vec![0u8; size];
                file.read_exact(&mut body)?;
                fmt = Some(parse_fmt(&body)?);
            }
            b"data" => {
                let mut body = vec![0u8; size];
                file.read_exact(&mut body)?;
                data = Some(body);
            }
            _ => {
                file.seek(SeekFrom::Current(size as i64))?;
            }
        }

        // RIFF chunks are word aligned.
        if size % 2 == 1 {
            file.seek(SeekFrom::Current(1))?;
        }

        if fmt.is_some() && data.is_some() {
            break;
        }
    }

    let (rate, channels, bits_per_sample, block_align, format_tag) =
        fmt.ok_or(WaveError::MissingChunk("fmt "))?;
    let data = data.ok_or(WaveError::MissingChunk("data"))?;

    Ok(WaveData {
        rate,
        channels,
        bits_per_sample,
        block_align,
        format_tag,
        data,
    })
}

/// Parses a `fmt ` chunk body; resolves EXTENSIBLE through the first word of
/// the sub-format GUID.
fn parse_fmt(body: &[u8]) -> Result<(u32, u16, u16, u16, u16), WaveError> {
    if body.len() < 16 {
        return Err(WaveError::MalformedChunk("fmt "));
    }
    let mut format_tag = u16::from_le_bytes([body[0], body[1]]);
    let channels = u16::from_le_bytes([body[2], body[3]]);
    let rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let block_align = u16::from_le_bytes([body[12], body[13]]);
    let bits_per_sample = u16::from_le_bytes([body[14], body[15]]);

    if format_tag == FORMAT_EXTENSIBLE {
        // cbSize (2) + valid bits (2) + channel mask (4) + GUID
        if body.len() < 26 {
            return Err(WaveError::MalformedChunk("fmt "));
        }
        let cb_size = u16::from_le_bytes([body[16], body[17]]);
        if cb_size >= 22 {
            format_tag = u16::from_le_bytes([body[24], body[25]]);
        }
    }

    if channels == 0 || rate == 0 || block_align == 0 {
        return Err(WaveError::MalformedChunk("fmt "));
    }

    Ok((rate, channels, bits_per_sample, block_align, format_tag))
}
