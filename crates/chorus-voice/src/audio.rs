//! Audio format normalization between the browser and the speech model.
//!
//! All audio is signed 16-bit little-endian PCM. A [`AudioFormatBridge`]
//! sits in each direction of a session and turns whatever arrives into
//! fixed 20 ms frames in the format the other side expects.
//!
//! The invariant everything here protects: conversions never change the
//! *duration* of audio. Down-mixing N stereo sample pairs yields N mono
//! samples, and resampling from rate A to rate B yields `len * B / A`
//! samples. Any conversion that gets the count wrong changes perceived
//! playback speed.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Duration of every frame the bridge emits.
pub const FRAME_DURATION_MS: u32 = 20;

/// Highest sample rate accepted from either endpoint.
const MAX_SAMPLE_RATE: u32 = 192_000;

/// Declared format of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 16-bit PCM at the given rate and channel count.
    pub const fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    /// Samples per channel in one 20 ms frame.
    pub fn samples_per_frame(&self) -> usize {
        self.sample_rate as usize * FRAME_DURATION_MS as usize / 1000
    }

    /// Checks that the bridge can handle this format.
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.bits_per_sample != 16 {
            return Err(VoiceError::UnsupportedBitDepth(self.bits_per_sample));
        }
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(VoiceError::InvalidSampleRate(self.sample_rate));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(VoiceError::UnsupportedLayout {
                channels: self.channels,
            });
        }
        Ok(())
    }
}

/// A block of interleaved PCM samples in a declared format.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub format: AudioFormat,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, format: AudioFormat) -> Self {
        Self { samples, format }
    }

    /// Decodes little-endian PCM bytes.
    pub fn from_le_bytes(bytes: &[u8], format: AudioFormat) -> Result<Self, VoiceError> {
        if bytes.len() % 2 != 0 {
            return Err(VoiceError::MalformedFrame(format!(
                "odd byte length {} for 16-bit PCM",
                bytes.len()
            )));
        }
        Ok(Self::new(pcm_from_le_bytes(bytes), format))
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm_to_le_bytes(&self.samples)
    }

    /// Number of sample frames (samples per channel).
    pub fn sample_frames(&self) -> usize {
        self.samples.len() / usize::from(self.format.channels.max(1))
    }

    pub fn duration_ms(&self) -> u32 {
        if self.format.sample_rate == 0 {
            return 0;
        }
        (self.sample_frames() as u64 * 1000 / u64::from(self.format.sample_rate)) as u32
    }

    /// Loudness mapped onto 0.0..=1.0: -60 dBFS and below is 0.0, full scale
    /// is 1.0. This is the scale the VAD threshold is expressed in.
    pub fn activity_level(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / 32_768.0;
                v * v
            })
            .sum();
        let rms = (sum_sq / self.samples.len() as f64).sqrt();
        if rms <= 0.0 {
            return 0.0;
        }
        let dbfs = 20.0 * rms.log10();
        ((dbfs + 60.0) / 60.0).clamp(0.0, 1.0) as f32
    }
}

pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Encodes PCM for the speech model's JSON audio fields.
pub fn encode_base64_pcm(samples: &[i16]) -> String {
    B64.encode(pcm_to_le_bytes(samples))
}

/// Decodes a base64 PCM payload from the speech model.
pub fn decode_base64_pcm(payload: &str) -> Result<Vec<i16>, VoiceError> {
    let bytes = B64.decode(payload)?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "odd byte length {} in base64 audio",
            bytes.len()
        )));
    }
    Ok(pcm_from_le_bytes(&bytes))
}

/// Multiplies samples by `gain`, clipping to the i16 range.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (f32::from(*sample) * gain).round();
        *sample = scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
}

/// Changes the channel count of interleaved samples without changing the
/// number of sample frames. Stereo to mono averages each pair; mono to stereo
/// duplicates each sample.
pub fn remix(samples: &[i16], from: u16, to: u16) -> Result<Vec<i16>, VoiceError> {
    for channels in [from, to] {
        if !(1..=2).contains(&channels) {
            return Err(VoiceError::UnsupportedLayout { channels });
        }
    }
    if samples.len() % usize::from(from) != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "{} samples is not a whole number of {}-channel frames",
            samples.len(),
            from
        )));
    }

    Ok(match (from, to) {
        (2, 1) => samples
            .chunks_exact(2)
            .map(|pair| ((i32::from(pair[0]) + i32::from(pair[1])) / 2) as i16)
            .collect(),
        (1, 2) => samples.iter().flat_map(|&s| [s, s]).collect(),
        _ => samples.to_vec(),
    })
}

/// Streaming linear-interpolation resampler for mono PCM.
///
/// Carries its fractional read position and the last input sample across
/// calls, so chunked input produces the same output count as one long
/// buffer would.
#[derive(Debug, Clone)]
pub struct Resampler {
    from: u32,
    to: u32,
    step: f64,
    pos: f64,
    last: Option<i16>,
}

impl Resampler {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            step: f64::from(from) / f64::from(to.max(1)),
            pos: 0.0,
            last: None,
        }
    }

    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.from == self.to {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let mut buf = Vec::with_capacity(input.len() + 1);
        if let Some(prev) = self.last {
            buf.push(prev);
        }
        buf.extend_from_slice(input);

        let last_index = (buf.len() - 1) as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / self.step).ceil() as usize + 1);
        while self.pos < last_index {
            let i = self.pos.floor() as usize;
            let frac = self.pos - i as f64;
            let a = f64::from(buf[i]);
            let b = f64::from(buf[i + 1]);
            out.push((a + (b - a) * frac).round() as i16);
            self.pos += self.step;
        }

        // Re-base so index 0 of the next buffer is this buffer's last sample.
        self.pos -= last_index;
        self.last = buf.last().copied();
        out
    }
}

/// Converts one frame from `source` to `target` format.
///
/// Stateless: intended for one-off conversions. Streams should go through an
/// [`AudioFormatBridge`], which keeps resampler state across frames. The
/// output always holds `sample_frames * target_rate / source_rate` sample
/// frames; a short interpolation tail is held at its last value.
pub fn normalize(
    frame: &AudioFrame,
    source: AudioFormat,
    target: AudioFormat,
) -> Result<AudioFrame, VoiceError> {
    source.validate()?;
    target.validate()?;
    let mono = remix(&frame.samples, source.channels, 1)?;
    let mut resampled = Resampler::new(source.sample_rate, target.sample_rate).process(&mono);
    let expected = resampled_len(mono.len(), source.sample_rate, target.sample_rate);
    let hold = resampled.last().or(mono.last()).copied().unwrap_or(0);
    resampled.resize(expected, hold);
    let samples = remix(&resampled, 1, target.channels)?;
    Ok(AudioFrame::new(samples, target))
}

/// Sample count after converting `len` samples from rate `from` to rate `to`.
fn resampled_len(len: usize, from: u32, to: u32) -> usize {
    if from == to || from == 0 {
        return len;
    }
    let (from, to) = (u64::from(from), u64::from(to));
    ((len as u64 * to + from / 2) / from) as usize
}

/// Streaming converter for one direction of a session.
///
/// Applies gain, down-mixes, resamples, and re-frames input into exact 20 ms
/// frames of the target format. Frames that cannot be converted are dropped
/// and logged; the stream continues.
#[derive(Debug)]
pub struct AudioFormatBridge {
    source: AudioFormat,
    target: AudioFormat,
    gain: f32,
    resampler: Resampler,
    pending: Vec<i16>,
}

impl AudioFormatBridge {
    pub fn new(source: AudioFormat, target: AudioFormat, gain: f32) -> Result<Self, VoiceError> {
        source.validate()?;
        target.validate()?;
        validate_gain(gain)?;
        Ok(Self {
            source,
            target,
            gain,
            resampler: Resampler::new(source.sample_rate, target.sample_rate),
            pending: Vec::new(),
        })
    }

    pub fn source(&self) -> AudioFormat {
        self.source
    }

    pub fn target(&self) -> AudioFormat {
        self.target
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Samples converted but not yet emitted as a full frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Converts a frame that declares its own format.
    ///
    /// A frame whose declared format differs from the current source is
    /// taken as the new truth about the sender.
    pub fn push(&mut self, frame: &AudioFrame) -> Vec<AudioFrame> {
        if frame.format != self.source {
            if let Err(e) = frame.format.validate() {
                tracing::warn!(
                    channels = frame.format.channels,
                    sample_rate = frame.format.sample_rate,
                    "dropping audio frame: {}",
                    e
                );
                return Vec::new();
            }
            tracing::info!(
                from = ?self.source,
                to = ?frame.format,
                "audio source format changed"
            );
            self.source = frame.format;
            self.resampler = Resampler::new(self.source.sample_rate, self.target.sample_rate);
        }
        self.push_samples(&frame.samples)
    }

    /// Converts raw little-endian PCM bytes in the current source format.
    pub fn push_pcm_bytes(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        match AudioFrame::from_le_bytes(bytes, self.source) {
            Ok(frame) => self.push_samples(&frame.samples),
            Err(e) => {
                tracing::warn!("dropping audio frame: {}", e);
                Vec::new()
            }
        }
    }

    fn push_samples(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        match self.convert(samples) {
            Ok(converted) => {
                self.pending.extend_from_slice(&converted);
                self.drain_frames()
            }
            Err(e) => {
                tracing::warn!("dropping audio frame: {}", e);
                Vec::new()
            }
        }
    }

    fn convert(&mut self, samples: &[i16]) -> Result<Vec<i16>, VoiceError> {
        let mut input = samples.to_vec();
        apply_gain(&mut input, self.gain);
        let mono = remix(&input, self.source.channels, 1)?;
        let resampled = self.resampler.process(&mono);
        remix(&resampled, 1, self.target.channels)
    }

    fn drain_frames(&mut self) -> Vec<AudioFrame> {
        let frame_len = self.target.samples_per_frame() * usize::from(self.target.channels);
        let mut frames = Vec::with_capacity(self.pending.len() / frame_len.max(1));
        while frame_len > 0 && self.pending.len() >= frame_len {
            let samples: Vec<i16> = self.pending.drain(..frame_len).collect();
            frames.push(AudioFrame::new(samples, self.target));
        }
        frames
    }

    /// Emits any remainder as one final frame padded with silence.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let frame_len = self.target.samples_per_frame() * usize::from(self.target.channels);
        let mut samples = std::mem::take(&mut self.pending);
        samples.resize(frame_len, 0);
        Some(AudioFrame::new(samples, self.target))
    }

    /// Re-targets the output sample rate, e.g. when the remote endpoint turns
    /// out to run at a different rate than it advertises. Unemitted samples at
    /// the old rate are discarded.
    pub fn set_target_rate(&mut self, sample_rate: u32) -> Result<(), VoiceError> {
        let target = AudioFormat {
            sample_rate,
            ..self.target
        };
        target.validate()?;
        if target != self.target {
            tracing::info!(
                from = self.target.sample_rate,
                to = sample_rate,
                discarded = self.pending.len(),
                "audio target rate reconfigured"
            );
            self.target = target;
            self.pending.clear();
            self.resampler = Resampler::new(self.source.sample_rate, sample_rate);
        }
        Ok(())
    }

    /// Re-declares the input format.
    pub fn set_source(&mut self, source: AudioFormat) -> Result<(), VoiceError> {
        source.validate()?;
        if source != self.source {
            self.source = source;
            self.resampler = Resampler::new(source.sample_rate, self.target.sample_rate);
        }
        Ok(())
    }

    pub fn set_gain(&mut self, gain: f32) -> Result<(), VoiceError> {
        validate_gain(gain)?;
        self.gain = gain;
        Ok(())
    }
}

fn validate_gain(gain: f32) -> Result<(), VoiceError> {
    if !gain.is_finite() || gain < 0.0 {
        return Err(VoiceError::Config(format!("invalid gain {gain}")));
    }
    Ok(())
}
