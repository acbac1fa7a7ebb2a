//! In-memory PCM sources and their voices.
//!
//! A [`PcmSource`] owns the raw bytes of a decoded WAVE file plus everything
//! derived from the mixer format: the per-sample decoder and the fixed-point
//! resampler step. A [`PcmVoice`] is a playback cursor over a shared source;
//! any number of voices can play the same source independently.
//!
//! Resampling is linear interpolation with a 16-bit fractional cursor. When
//! the interpolation window would run past the last frame the read ends
//! early and the cursor rewinds, so the caller decides between looping and
//! deactivation.

use std::sync::Arc;

use crate::engine::constants::{FP_MASK, FP_SHIFT};
use crate::engine::decoders::{self, AuFormat, SampleDecoder};
use crate::engine::errors::SourceLoadError;
use crate::engine::wave::{self, WaveData};
use crate::engine::MixFormat;

/// An immutable PCM source shared by its voices.
pub(crate) struct PcmSource {
    format: AuFormat,
    /// Input sample rate in Hz.
    rate: u32,
    /// Input channel count.
    channels: usize,
    /// Bytes of one channel element.
    channel_bytes: usize,
    /// Bytes of one frame across all channels.
    frame_bytes: usize,
    /// Total input frames.
    frame_count: usize,
    /// Raw sample bytes, shared with live voices.
    data: Arc<[u8]>,

    decoder: SampleDecoder,
    /// Fixed-point cursor advance per output frame.
    step: u64,
    out_channels: usize,
}

impl PcmSource {
    /// Builds a source from a parsed WAVE file, targeting the mixer format.
    pub fn new(wave: WaveData, out: &MixFormat) -> Result<Self, SourceLoadError> {
        let format = au_format(wave.format_tag, wave.bits_per_sample).ok_or(
            SourceLoadError::UnsupportedWaveFormat {
                tag: wave.format_tag,
                bits: wave.bits_per_sample,
            },
        )?;
        if wave.channels == 0 {
            return Err(SourceLoadError::UnsupportedChannels(0));
        }

        let channels = wave.channels as usize;
        let frame_bytes = wave.block_align as usize;
        let channel_bytes = frame_bytes / channels;
        if channel_bytes == 0 {
            return Err(SourceLoadError::UnsupportedChannels(wave.channels));
        }
        let frame_count = wave.data.len() / frame_bytes;
        // Drop any trailing partial frame so the wrap-around interpolation
        // partner always addresses a whole frame.
        let mut data = wave.data;
        data.truncate(frame_count * frame_bytes);

        let mut source = Self {
            format,
            rate: wave.rate,
            channels,
            channel_bytes,
            frame_bytes,
            frame_count,
            data: Arc::from(data.into_boxed_slice()),
            decoder: decoders::select(format, out.bits),
            step: 0,
            out_channels: out.channels as usize,
        };
        source.set_output_format(out);
        Ok(source)
    }

    /// Re-derives decoder, step and channel mapping for a new mixer format.
    pub fn set_output_format(&mut self, out: &MixFormat) {
        self.decoder = decoders::select(self.format, out.bits);
        self.step = ((self.rate as u64) << FP_SHIFT) / out.rate as u64;
        self.out_channels = out.channels as usize;
    }

    /// Same source retargeted to a new format; the data blob is shared.
    pub fn retargeted(&self, out: &MixFormat) -> Self {
        let mut copy = Self {
            format: self.format,
            rate: self.rate,
            channels: self.channels,
            channel_bytes: self.channel_bytes,
            frame_bytes: self.frame_bytes,
            frame_count: self.frame_count,
            data: self.data.clone(),
            decoder: self.decoder,
            step: self.step,
            out_channels: self.out_channels,
        };
        copy.set_output_format(out);
        copy
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Duration of the source in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        self.frame_count as f64 / self.rate as f64
    }

    /// Core read: interpolates up to `frames` output frames into `out`,
    /// advancing `cursor`/`frac`. Stops early when the window passes the
    /// last input frame.
    fn read_interpolated(
        &self,
        out: &mut [i32],
        frames: usize,
        cursor: &mut i64,
        frac: &mut u64,
    ) -> usize {
        if self.frame_count == 0 || *cursor < 0 || (*cursor as usize) >= self.frame_count {
            return 0;
        }
        match (self.channels > 1, self.out_channels > 1) {
            (true, true) => self.read_stereo_to_stereo(out, frames, cursor, frac),
            (false, true) => self.read_mono_to_stereo(out, frames, cursor, frac),
            (_, false) => self.read_any_to_mono(out, frames, cursor, frac),
        }
    }

    fn lerp(v1: i32, v2: i32, frac: u64) -> i32 {
        ((((v2 - v1) as i64 * frac as i64) >> FP_SHIFT) + v1 as i64) as i32
    }

    fn read_stereo_to_stereo(
        &self,
        out: &mut [i32],
        frames: usize,
        cursor: &mut i64,
        frac: &mut u64,
    ) -> usize {
        let data = &self.data[..];
        let size = self.frame_count;
        let mut produced = 0;

        let mut idx = *cursor as usize * self.frame_bytes;
        let mut vl = (self.decoder)(&data[idx..]);
        let mut vr = (self.decoder)(&data[idx + self.channel_bytes..]);
        idx = (idx + self.frame_bytes) % data.len();
        let mut vl2 = (self.decoder)(&data[idx..]);
        let mut vr2 = (self.decoder)(&data[idx + self.channel_bytes..]);

        while produced < frames {
            out[produced * 2] = Self::lerp(vl, vl2, *frac);
            out[produced * 2 + 1] = Self::lerp(vr, vr2, *frac);
            produced += 1;

            *frac += self.step;
            let advance = *frac >> FP_SHIFT;
            if advance > 0 {
                *cursor += advance as i64;
                *frac &= FP_MASK;
                if *cursor as usize >= size {
                    break;
                }
                idx = *cursor as usize * self.frame_bytes;
                vl = (self.decoder)(&data[idx..]);
                vr = (self.decoder)(&data[idx + self.channel_bytes..]);
                idx = (idx + self.frame_bytes) % data.len();
                vl2 = (self.decoder)(&data[idx..]);
                vr2 = (self.decoder)(&data[idx + self.channel_bytes..]);
            }
        }
        produced
    }

    fn read_mono_to_stereo(
        &self,
        out: &mut [i32],
        frames: usize,
        cursor: &mut i64,
        frac: &mut u64,
    ) -> usize {
        let data = &self.data[..];
        let size = self.frame_count;
        let mut produced = 0;

        let mut idx = *cursor as usize * self.frame_bytes;
        let mut v = (self.decoder)(&data[idx..]);
        idx = (idx + self.frame_bytes) % data.len();
        let mut w = (self.decoder)(&data[idx..]);

        while produced < frames {
            let l = Self::lerp(v, w, *frac);
            out[produced * 2] = l;
            out[produced * 2 + 1] = l;
            produced += 1;

            *frac += self.step;
            let advance = *frac >> FP_SHIFT;
            if advance > 0 {
                *cursor += advance as i64;
                *frac &= FP_MASK;
                if *cursor as usize >= size {
                    break;
                }
                idx = *cursor as usize * self.frame_bytes;
                v = (self.decoder)(&data[idx..]);
                idx = (idx + self.frame_bytes) % data.len();
                w = (self.decoder)(&data[idx..]);
            }
        }
        produced
    }

    fn read_any_to_mono(
        &self,
        out: &mut [i32],
        frames: usize,
        cursor: &mut i64,
        frac: &mut u64,
    ) -> usize {
        let data = &self.data[..];
        let size = self.frame_count;
        let shift = self.channels >> 1;
        let mut produced = 0;

        let decode_sum = |idx: usize| -> (i32, i32) {
            let idx2 = (idx + self.frame_bytes) % data.len();
            let mut v = 0;
            let mut w = 0;
            for c in 0..self.channels {
                let offset = c * self.channel_bytes;
                v += (self.decoder)(&data[idx + offset..]);
                w += (self.decoder)(&data[idx2 + offset..]);
            }
            (v, w)
        };

        let (mut v, mut w) = decode_sum(*cursor as usize * self.frame_bytes);

        while produced < frames {
            out[produced] = Self::lerp(v, w, *frac) >> shift;
            produced += 1;

            *frac += self.step;
            let advance = *frac >> FP_SHIFT;
            if advance > 0 {
                *cursor += advance as i64;
                *frac &= FP_MASK;
                if *cursor as usize >= size {
                    break;
                }
                let pair = decode_sum(*cursor as usize * self.frame_bytes);
                v = pair.0;
                w = pair.1;
            }
        }
        produced
    }
}

/// A playback cursor over a shared [`PcmSource`].
pub(crate) struct PcmVoice {
    source: Arc<PcmSource>,
    cursor: i64,
    frac: u64,
}

impl PcmVoice {
    pub fn new(source: Arc<PcmSource>) -> Self {
        Self {
            source,
            cursor: 0,
            frac: 0,
        }
    }

    /// Reads up to `frames` output frames. A short count means the source
    /// end was reached; the cursor has already rewound for the next call.
    pub fn read(&mut self, out: &mut [i32], frames: usize) -> usize {
        let produced =
            self.source
                .read_interpolated(out, frames, &mut self.cursor, &mut self.frac);
        if produced < frames {
            self.cursor = 0;
            self.frac = 0;
        }
        produced
    }

    /// Seeks to an input frame position, clamped into the source.
    pub fn seek(&mut self, frame: i64) {
        let max = self.source.frame_count() as i64;
        self.cursor = frame.clamp(0, max.saturating_sub(1).max(0));
        self.frac = 0;
    }

    /// Seeks to a position in seconds.
    pub fn seek_time(&mut self, seconds: f64) {
        if seconds < 0.0 || seconds >= self.source.duration_secs() {
            return;
        }
        self.seek((self.source.rate() as f64 * seconds) as i64);
    }
}

/// Maps a resolved WAVE format tag and bit depth onto a decoder format.
fn au_format(tag: u16, bits: u16) -> Option<AuFormat> {
    match tag {
        wave::FORMAT_ALAW => Some(AuFormat::ALaw),
        wave::FORMAT_MULAW => Some(AuFormat::MuLaw),
        wave::FORMAT_PCM => match bits {
            8 => Some(AuFormat::Uint8),
            // 12-bit material is stored left-aligned in 16-bit words.
            12 | 16 => Some(AuFormat::Int16),
            24 => Some(AuFormat::Int24),
            32 => Some(AuFormat::Int32),
            _ => None,
        },
        wave::FORMAT_IEEE_FLOAT => match bits {
            32 => Some(AuFormat::Float32),
            64 => Some(AuFormat::Float64),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mix_format(rate: u32, channels: u8, bits: u8) -> MixFormat {
        MixFormat {
            rate,
            channels,
            bits,
            voice_capacity: 4,
        }
    }

    fn pcm16_wave(rate: u32, channels: u16, samples: &[i16]) -> WaveData {
        WaveData {
            rate,
            channels,
            bits_per_sample: 16,
            block_align: channels * 2,
            format_tag: wave::FORMAT_PCM,
            data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }

    fn mono_source(rate: u32, samples: &[i16], out: &MixFormat) -> Arc<PcmSource> {
        Arc::new(PcmSource::new(pcm16_wave(rate, 1, samples), out).unwrap())
    }

    #[test]
    fn test_identity_read_at_mixer_rate() {
        let out = mix_format(44_100, 1, 16);
        let source = mono_source(44_100, &[100, -200, 300, -400], &out);
        let mut voice = PcmVoice::new(source);

        let mut buf = [0i32; 4];
        let got = voice.read(&mut buf, 4);
        assert_eq!(got, 4);
        assert_eq!(buf, [100, -200, 300, -400]);
    }

    #[test]
    fn test_mono_duplicates_to_stereo() {
        let out = mix_format(44_100, 2, 16);
        let source = mono_source(44_100, &[0x1000, -0x1000], &out);
        let mut voice = PcmVoice::new(source);

        let mut buf = [0i32; 4];
        let got = voice.read(&mut buf, 2);
        assert_eq!(got, 2);
        assert_eq!(buf, [0x1000, 0x1000, -0x1000, -0x1000]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let out = mix_format(44_100, 1, 16);
        let wave = pcm16_wave(44_100, 2, &[100, 300, -100, -300]);
        let source = Arc::new(PcmSource::new(wave, &out).unwrap());
        let mut voice = PcmVoice::new(source);

        let mut buf = [0i32; 2];
        let got = voice.read(&mut buf, 2);
        assert_eq!(got, 2);
        assert_eq!(buf, [200, -200]);
    }

    #[test]
    fn test_stereo_to_stereo_keeps_sides() {
        let out = mix_format(44_100, 2, 16);
        let wave = pcm16_wave(44_100, 2, &[11, 22, 33, 44]);
        let source = Arc::new(PcmSource::new(wave, &out).unwrap());
        let mut voice = PcmVoice::new(source);

        let mut buf = [0i32; 4];
        assert_eq!(voice.read(&mut buf, 2), 2);
        assert_eq!(buf, [11, 22, 33, 44]);
    }

    #[test]
    fn test_downsampling_interpolates() {
        // Input at twice the mixer rate: step = 2.0, every other frame.
        let out = mix_format(22_050, 1, 16);
        let source = mono_source(44_100, &[0, 100, 200, 300, 400, 500], &out);
        let mut voice = PcmVoice::new(source);

        let mut buf = [0i32; 3];
        let got = voice.read(&mut buf, 3);
        assert_eq!(got, 3);
        assert_eq!(buf, [0, 200, 400]);
    }

    #[test]
    fn test_upsampling_interpolates_midpoints() {
        // Input at half the mixer rate: step = 0.5.
        let out = mix_format(44_100, 1, 16);
        let source = mono_source(22_050, &[0, 100, 200], &out);
        let mut voice = PcmVoice::new(source);

        let mut buf = [0i32; 4];
        let got = voice.read(&mut buf, 4);
        assert_eq!(got, 4);
        assert_eq!(buf, [0, 50, 100, 150]);
    }

    #[test]
    fn test_short_read_rewinds() {
        let out = mix_format(44_100, 1, 16);
        let source = mono_source(44_100, &[7, 8], &out);
        let mut voice = PcmVoice::new(source);

        let mut buf = [0i32; 8];
        let got = voice.read(&mut buf, 8);
        assert_eq!(got, 2);
        assert_eq!(&buf[..2], &[7, 8]);

        // The cursor rewound: the next read starts over.
        let got = voice.read(&mut buf, 2);
        assert_eq!(got, 2);
        assert_eq!(&buf[..2], &[7, 8]);
    }

    #[test]
    fn test_loop_concatenation_is_gapless() {
        let out = mix_format(44_100, 1, 16);
        let source = mono_source(44_100, &[1, 2, 3], &out);
        let mut voice = PcmVoice::new(source);

        let mut collected = Vec::new();
        let mut buf = [0i32; 4];
        while collected.len() < 9 {
            let got = voice.read(&mut buf, (9 - collected.len()).min(4));
            assert!(got > 0);
            collected.extend_from_slice(&buf[..got]);
        }
        assert_eq!(collected, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_seek_clamps() {
        let out = mix_format(44_100, 1, 16);
        let source = mono_source(44_100, &[5, 6, 7], &out);
        let mut voice = PcmVoice::new(source);

        voice.seek(1);
        let mut buf = [0i32; 3];
        assert_eq!(voice.read(&mut buf, 3), 2);
        assert_eq!(&buf[..2], &[6, 7]);

        voice.seek(100);
        assert_eq!(voice.read(&mut buf, 1), 1);
        assert_eq!(buf[0], 7);

        voice.seek(-5);
        assert_eq!(voice.read(&mut buf, 1), 1);
        assert_eq!(buf[0], 5);
    }

    #[test]
    fn test_seek_time() {
        let out = mix_format(44_100, 1, 16);
        let samples: Vec<i16> = (0..44_100).map(|i| (i % 100) as i16).collect();
        let source = mono_source(44_100, &samples, &out);
        let mut voice = PcmVoice::new(source);

        voice.seek_time(0.5);
        let mut buf = [0i32; 1];
        assert_eq!(voice.read(&mut buf, 1), 1);
        assert_eq!(buf[0], (22_050 % 100) as i32);

        // Out-of-range positions are ignored.
        voice.seek(0);
        voice.seek_time(2.0);
        assert_eq!(voice.read(&mut buf, 1), 1);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_empty_source_reads_nothing() {
        let out = mix_format(44_100, 1, 16);
        let source = mono_source(44_100, &[], &out);
        let mut voice = PcmVoice::new(source);
        let mut buf = [0i32; 4];
        assert_eq!(voice.read(&mut buf, 4), 0);
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let out = mix_format(44_100, 1, 16);
        let mut wave = pcm16_wave(44_100, 1, &[0]);
        wave.bits_per_sample = 20;
        assert!(matches!(
            PcmSource::new(wave, &out),
            Err(SourceLoadError::UnsupportedWaveFormat { .. })
        ));
    }

    #[test]
    fn test_retarget_changes_step() {
        let out16 = mix_format(44_100, 1, 16);
        let source = PcmSource::new(pcm16_wave(44_100, 1, &[0, 100]), &out16).unwrap();
        let out24 = mix_format(22_050, 1, 24);
        let retargeted = source.retargeted(&out24);
        assert_eq!(retargeted.step, source.step * 2);

        // The 24-bit decoder widens samples by 8 bits.
        let mut voice = PcmVoice::new(Arc::new(retargeted));
        let mut buf = [0i32; 1];
        assert_eq!(voice.read(&mut buf, 1), 1);
        assert_eq!(buf[0], 0);
    }
}
