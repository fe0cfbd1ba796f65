use chorus_types::TurnMode;
use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::error::VoiceError;
use crate::turn::TurnDetectionConfig;

fn default_input_gain() -> f32 {
    4.0
}

fn default_debug_capture_dir() -> String {
    "debug_audio".to_string()
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_prefix_padding_ms() -> u32 {
    300
}

fn default_silence_duration_ms() -> u32 {
    500
}

fn default_min_speech_ms() -> u32 {
    40
}

fn default_browser_sample_rate() -> u32 {
    48_000
}

fn default_browser_channels() -> u16 {
    1
}

fn default_model_sample_rate() -> u32 {
    24_000
}

fn default_autopause_window_ms() -> u64 {
    1_200
}

/// When the assistant is told to speak about downstream progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrationPolicy {
    /// Only after a run reports completion.
    #[default]
    OnCompletion,
    /// Once while a run is in progress, then again on completion.
    MidRunOnce,
    /// Downstream messages are recorded but never narrated.
    Never,
}

/// Per-deployment voice settings (`[voice]` in the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Linear gain applied to browser input before it reaches the model.
    #[serde(default = "default_input_gain")]
    pub input_gain: f32,
    /// Write raw browser input to WAV files.
    #[serde(default)]
    pub debug_capture: bool,
    #[serde(default = "default_debug_capture_dir")]
    pub debug_capture_dir: String,
    #[serde(default)]
    pub turn_mode: TurnMode,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_ms: u32,
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u32,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,
    #[serde(default = "default_browser_sample_rate")]
    pub browser_sample_rate: u32,
    #[serde(default = "default_browser_channels")]
    pub browser_channels: u16,
    /// The rate the speech model actually accepts and emits. Must match
    /// the deployed model; there is no negotiation.
    #[serde(default = "default_model_sample_rate")]
    pub model_sample_rate: u32,
    /// Automatic pause requests within this many milliseconds of a team
    /// delegation are ignored.
    #[serde(default = "default_autopause_window_ms")]
    pub autopause_window_ms: u64,
    #[serde(default)]
    pub narration: NarrationPolicy,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            input_gain: default_input_gain(),
            debug_capture: false,
            debug_capture_dir: default_debug_capture_dir(),
            turn_mode: TurnMode::default(),
            vad_threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
            min_speech_ms: default_min_speech_ms(),
            browser_sample_rate: default_browser_sample_rate(),
            browser_channels: default_browser_channels(),
            model_sample_rate: default_model_sample_rate(),
            autopause_window_ms: default_autopause_window_ms(),
            narration: NarrationPolicy::default(),
        }
    }
}

impl VoiceConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(VoiceError::Config(format!(
                "vad_threshold must be within 0.0-1.0, got {}",
                self.vad_threshold
            )));
        }
        if !self.input_gain.is_finite() || self.input_gain < 0.0 {
            return Err(VoiceError::Config(format!(
                "input_gain must be a non-negative number, got {}",
                self.input_gain
            )));
        }
        if self.silence_duration_ms == 0 {
            return Err(VoiceError::Config(
                "silence_duration_ms must be greater than zero".to_string(),
            ));
        }
        self.browser_format()
            .validate()
            .map_err(|e| VoiceError::Config(format!("browser audio: {e}")))?;
        self.model_format()
            .validate()
            .map_err(|e| VoiceError::Config(format!("model audio: {e}")))?;
        Ok(())
    }

    pub fn turn_detection(&self) -> TurnDetectionConfig {
        TurnDetectionConfig {
            threshold: self.vad_threshold,
            prefix_padding_ms: self.prefix_padding_ms,
            silence_duration_ms: self.silence_duration_ms,
            min_speech_ms: self.min_speech_ms,
        }
    }

    pub fn browser_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.browser_sample_rate, self.browser_channels)
    }

    /// The model side is always mono.
    pub fn model_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.model_sample_rate, 1)
    }
}
