//! Raw input capture for offline debugging.
//!
//! When enabled, every browser audio frame is written, before gain or
//! resampling, to `{dir}/{session_id}_{conversation_id}.wav`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::audio::AudioFormat;
use crate::error::VoiceError;

pub struct RawCapture {
    path: PathBuf,
    format: AudioFormat,
    writer: WavWriter<BufWriter<File>>,
    samples_written: u64,
}

impl RawCapture {
    /// Opens a new capture file, creating `dir` if needed.
    pub fn create(
        dir: impl AsRef<Path>,
        session_id: &str,
        conversation_id: &str,
        format: AudioFormat,
    ) -> Result<Self, VoiceError> {
        format.validate()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}_{}.wav",
            sanitize(session_id),
            sanitize(conversation_id)
        ));
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)?;
        tracing::debug!(path = %path.display(), "raw audio capture opened");
        Ok(Self {
            path,
            format,
            writer,
            samples_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Appends interleaved samples. The layout must match the capture format.
    pub fn write(&mut self, samples: &[i16]) -> Result<(), VoiceError> {
        let mut writer = self.writer.get_i16_writer(samples.len() as u32);
        for &s in samples {
            writer.write_sample(s);
        }
        writer.flush()?;
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Writes the WAV header and closes the file.
    pub fn finalize(self) -> Result<PathBuf, VoiceError> {
        self.writer.finalize()?;
        tracing::debug!(
            path = %self.path.display(),
            samples = self.samples_written,
            "raw audio capture closed"
        );
        Ok(self.path)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
