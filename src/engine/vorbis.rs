//! Streaming Ogg Vorbis sources and their voices.
//!
//! Every voice opens its own decoder over the source file, so voices seek
//! and loop independently. The decoder is reached through the pull-based
//! [`OggStream`] contract: `read` delivers decoded 16-bit little-endian
//! interleaved bytes, and `section` changes whenever a chained stream may
//! have switched rate or channel count.
//!
//! The voice keeps a 4 KiB byte scratch holding a sliding two-frame
//! interpolation window (`idx_1`, `idx_2 = idx_1 + frame_bytes`,
//! `idx_lim = idx_2 + frame_bytes`). When the window runs past the buffered
//! bytes, the unread tail is compacted to the front and more bytes are
//! pulled. On end of stream the voice seeks back to the start and returns
//! what it produced, mirroring the PCM auto-rewind.

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer as SymphoniaSampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_VORBIS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use symphonia::default::{get_codecs, get_probe};

use crate::engine::constants::{FP_MASK, FP_SHIFT, VORBIS_SCRATCH_BYTES};
use crate::engine::decoders::{self, AuFormat, SampleDecoder};
use crate::engine::errors::SourceLoadError;
use crate::engine::MixFormat;

/// Pull-based decoded-audio stream, 16-bit little-endian interleaved.
pub(crate) trait OggStream: Send {
    /// Fills `buf` with decoded bytes; may return fewer than requested.
    /// Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Seeks to an absolute pcm frame.
    fn seek_frame(&mut self, frame: u64);

    /// Seeks to a position in seconds.
    fn seek_time(&mut self, seconds: f64);

    /// Sample rate of the current logical section.
    fn rate(&self) -> u32;

    /// Channel count of the current logical section.
    fn channels(&self) -> usize;

    /// Identifier of the current logical section.
    fn section(&self) -> i32;
}

/// A Vorbis source: the file path plus the derived output parameters.
pub(crate) struct VorbisSource {
    path: PathBuf,
    mixer_rate: u32,
    out_channels: usize,
    decoder: SampleDecoder,
}

impl VorbisSource {
    pub fn new(path: PathBuf, out: &MixFormat) -> Self {
        Self {
            path,
            mixer_rate: out.rate,
            out_channels: out.channels as usize,
            decoder: decoders::select(AuFormat::Int16, out.bits),
        }
    }

    /// Same file retargeted to a new mixer format.
    pub fn retargeted(&self, out: &MixFormat) -> Self {
        Self::new(self.path.clone(), out)
    }

    /// Opens a fresh decoder instance for one voice.
    pub fn create_voice(&self) -> Result<VorbisVoice, SourceLoadError> {
        let stream = OggFile::open(&self.path)?;
        Ok(VorbisVoice::new(
            Box::new(stream),
            self.mixer_rate,
            self.out_channels,
            self.decoder,
        ))
    }

    /// Checks whether `path` opens as an Ogg Vorbis stream.
    pub fn probe(path: &Path) -> Result<(), SourceLoadError> {
        OggFile::open(path).map(|_| ())
    }
}

/// One playing instance of a Vorbis source.
pub(crate) struct VorbisVoice {
    stream: Box<dyn OggStream>,
    mixer_rate: u32,
    out_channels: usize,
    decoder: SampleDecoder,

    /// Decoded-byte scratch with a sliding interpolation window.
    buf: Box<[u8]>,
    buf_len: usize,
    idx_1: usize,
    idx_2: usize,
    idx_lim: usize,

    /// Input format of the current logical section.
    rate: u32,
    channels: usize,
    frame_bytes: usize,
    last_section: i32,

    step: u64,
    frac: u64,
}

impl VorbisVoice {
    pub fn new(
        stream: Box<dyn OggStream>,
        mixer_rate: u32,
        out_channels: usize,
        decoder: SampleDecoder,
    ) -> Self {
        Self {
            stream,
            mixer_rate,
            out_channels,
            decoder,
            buf: vec![0; VORBIS_SCRATCH_BYTES].into_boxed_slice(),
            buf_len: 0,
            idx_1: 0,
            idx_2: 0,
            // Sentinel: forces the first refill to establish the window.
            idx_lim: usize::MAX,
            rate: 0,
            channels: 0,
            frame_bytes: 0,
            last_section: -1,
            step: 0,
            frac: 0,
        }
    }

    /// Re-reads rate/channels after a logical section change.
    fn configure(&mut self) {
        self.rate = self.stream.rate();
        self.channels = self.stream.channels().max(1);
        self.frame_bytes = 2 * self.channels;
        self.step = ((self.rate as u64) << FP_SHIFT) / self.mixer_rate.max(1) as u64;
        self.last_section = self.stream.section();
    }

    /// Makes `[idx_1, idx_lim)` valid buffered bytes, compacting and pulling
    /// from the decoder as needed. Returns false at end of stream.
    fn ensure_window(&mut self) -> bool {
        while self.idx_lim > self.buf_len {
            if self.idx_1 >= self.buf_len {
                // Nothing usable buffered; a large resampling step may carry
                // an offset past the buffer end into the next pull.
                self.idx_1 -= self.buf_len;
                let got = self.stream.read(&mut self.buf);
                if got == 0 {
                    self.buf_len = 0;
                    return false;
                }
                self.buf_len = got;
            } else {
                // Preserve the unread tail, then top the buffer up.
                let keep = self.buf_len - self.idx_1;
                self.buf.copy_within(self.idx_1..self.buf_len, 0);
                self.idx_1 = 0;
                let got = self.stream.read(&mut self.buf[keep..]);
                if got == 0 {
                    self.buf_len = 0;
                    return false;
                }
                self.buf_len = keep + got;
            }
            if self.stream.section() != self.last_section {
                self.configure();
            }
            self.idx_2 = self.idx_1 + self.frame_bytes;
            self.idx_lim = self.idx_2 + self.frame_bytes;
        }
        true
    }

    /// Reads up to `frames` output frames. A short count means end of
    /// stream; the voice has already rewound for the next call. The
    /// fractional cursor is preserved across the rewind so looped playback
    /// stays phase-continuous.
    pub fn read(&mut self, out: &mut [i32], frames: usize) -> usize {
        let mut produced = 0;
        while produced < frames {
            if !self.ensure_window() {
                self.rewind();
                break;
            }

            if self.out_channels == 1 {
                let shift = self.channels >> 1;
                let mut v_1 = 0i32;
                let mut v_2 = 0i32;
                for c in 0..self.channels {
                    let off = c * 2;
                    v_1 += (self.decoder)(&self.buf[self.idx_1 + off..]);
                    v_2 += (self.decoder)(&self.buf[self.idx_2 + off..]);
                }
                out[produced] = lerp(v_1, v_2, self.frac) >> shift;
            } else if self.channels > 1 {
                let vl_1 = (self.decoder)(&self.buf[self.idx_1..]);
                let vr_1 = (self.decoder)(&self.buf[self.idx_1 + 2..]);
                let vl_2 = (self.decoder)(&self.buf[self.idx_2..]);
                let vr_2 = (self.decoder)(&self.buf[self.idx_2 + 2..]);
                out[produced * 2] = lerp(vl_1, vl_2, self.frac);
                out[produced * 2 + 1] = lerp(vr_1, vr_2, self.frac);
            } else {
                let v_1 = (self.decoder)(&self.buf[self.idx_1..]);
                let v_2 = (self.decoder)(&self.buf[self.idx_2..]);
                let l = lerp(v_1, v_2, self.frac);
                out[produced * 2] = l;
                out[produced * 2 + 1] = l;
            }
            produced += 1;

            self.frac += self.step;
            let advance = self.frac >> FP_SHIFT;
            if advance > 0 {
                self.frac &= FP_MASK;
                self.idx_1 += advance as usize * self.frame_bytes;
                self.idx_2 = self.idx_1 + self.frame_bytes;
                self.idx_lim = self.idx_2 + self.frame_bytes;
            }
        }
        produced
    }

    fn rewind(&mut self) {
        self.stream.seek_frame(0);
        self.reset_window();
    }

    fn reset_window(&mut self) {
        self.buf_len = 0;
        self.idx_1 = 0;
        if self.frame_bytes > 0 {
            self.idx_2 = self.frame_bytes;
            self.idx_lim = 2 * self.frame_bytes;
        } else {
            self.idx_lim = usize::MAX;
        }
    }

    /// Seeks to an absolute input frame.
    pub fn seek(&mut self, frame: u64) {
        self.stream.seek_frame(frame);
        self.frac = 0;
        self.reset_window();
    }

    /// Seeks to a position in seconds.
    pub fn seek_time(&mut self, seconds: f64) {
        self.stream.seek_time(seconds.max(0.0));
        self.frac = 0;
        self.reset_window();
    }
}

fn lerp(v1: i32, v2: i32, frac: u64) -> i32 {
    ((((v2 - v1) as i64 * frac as i64) >> FP_SHIFT) + v1 as i64) as i32
}

/* ---------- symphonia-backed stream ---------- */

/// [`OggStream`] over a symphonia Ogg/Vorbis decoder.
///
/// Chained Ogg files surface as logical-section changes: when the reader
/// signals a reset, the new bitstream's parameters are adopted and the
/// section counter increments so the voice re-reads rate/channels.
pub(crate) struct OggFile {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    rate: u32,
    channels: usize,
    /// Logical bitstream counter; bumped on every reader reset.
    section: i32,
    /// Decoded bytes not yet handed to the voice.
    carry: Vec<u8>,
    carry_pos: usize,
    eof: bool,
}

impl OggFile {
    pub fn open(path: &Path) -> Result<Self, SourceLoadError> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .default_track()
            .ok_or(SourceLoadError::NoDefaultTrack)?;
        if track.codec_params.codec != CODEC_TYPE_VORBIS {
            return Err(SourceLoadError::NotVorbis);
        }
        let rate = track
            .codec_params
            .sample_rate
            .ok_or(SourceLoadError::MissingSampleRate)?;
        let channels = track
            .codec_params
            .channels
            .ok_or(SourceLoadError::MissingChannels)?
            .count();
        let track_id = track.id;

        let decoder = get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            rate,
            channels,
            section: 0,
            carry: Vec::new(),
            carry_pos: 0,
            eof: false,
        })
    }

    /// Adopts the parameters of the new logical bitstream after the reader
    /// signalled a reset. Returns false when the new stream is unusable.
    fn begin_section(&mut self) -> bool {
        let (track_id, rate, channels, params) = {
            let Some(track) = self.format.default_track() else {
                return false;
            };
            if track.codec_params.codec != CODEC_TYPE_VORBIS {
                return false;
            }
            let Some(rate) = track.codec_params.sample_rate else {
                return false;
            };
            let Some(channels) = track.codec_params.channels.map(|c| c.count()) else {
                return false;
            };
            (track.id, rate, channels, track.codec_params.clone())
        };
        let decoder = match get_codecs().make(&params, &DecoderOptions::default()) {
            Ok(decoder) => decoder,
            Err(err) => {
                log::warn!("vorbis section decoder failed: {err}");
                return false;
            }
        };
        self.track_id = track_id;
        self.rate = rate;
        self.channels = channels;
        self.decoder = decoder;
        self.section += 1;
        true
    }

    /// Decodes packets until some samples land in the carry buffer.
    fn decode_more(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return false;
                }
                // A new logical bitstream begins; pick up its parameters
                // and keep decoding.
                Err(SymphoniaError::ResetRequired) => {
                    if !self.begin_section() {
                        self.eof = true;
                        return false;
                    }
                    continue;
                }
                Err(err) => {
                    log::warn!("vorbis packet read failed: {err}");
                    self.eof = true;
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(audio_buf) => {
                    let spec = *audio_buf.spec();
                    let capacity = audio_buf.capacity() as u64;
                    let mut samples = SymphoniaSampleBuffer::<i16>::new(capacity, spec);
                    samples.copy_interleaved_ref(audio_buf);
                    self.carry.clear();
                    self.carry_pos = 0;
                    for sample in samples.samples() {
                        self.carry.extend_from_slice(&sample.to_le_bytes());
                    }
                    if !self.carry.is_empty() {
                        return true;
                    }
                }
                // A corrupt packet is recoverable; try the next one.
                Err(SymphoniaError::DecodeError(err)) => {
                    log::warn!("vorbis packet decode failed: {err}");
                }
                Err(SymphoniaError::ResetRequired) => {
                    if !self.begin_section() {
                        self.eof = true;
                        return false;
                    }
                }
                Err(err) => {
                    log::warn!("vorbis decode failed: {err}");
                    self.eof = true;
                    return false;
                }
            }
        }
    }
}

impl OggStream for OggFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.carry_pos >= self.carry.len() {
            if self.eof || !self.decode_more() {
                return 0;
            }
        }
        let n = (self.carry.len() - self.carry_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.carry[self.carry_pos..self.carry_pos + n]);
        self.carry_pos += n;
        n
    }

    fn seek_frame(&mut self, frame: u64) {
        let result = self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame,
                track_id: self.track_id,
            },
        );
        if let Err(err) = result {
            log::warn!("vorbis seek failed: {err}");
        }
        self.decoder.reset();
        self.carry.clear();
        self.carry_pos = 0;
        self.eof = false;
    }

    fn seek_time(&mut self, seconds: f64) {
        let result = self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: Time::from(seconds.max(0.0)),
                track_id: Some(self.track_id),
            },
        );
        if let Err(err) = result {
            log::warn!("vorbis seek failed: {err}");
        }
        self.decoder.reset();
        self.carry.clear();
        self.carry_pos = 0;
        self.eof = false;
    }

    fn rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn section(&self) -> i32 {
        self.section
    }
}
