use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("unsupported channel layout: {channels} channel(s)")]
    UnsupportedLayout { channels: u16 },

    #[error("unsupported bit depth: {0} (only 16-bit PCM is supported)")]
    UnsupportedBitDepth(u16),

    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("malformed audio frame: {0}")]
    MalformedFrame(String),

    #[error("invalid audio payload encoding: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("capture error: {0}")]
    Capture(#[from] hound::Error),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid voice configuration: {0}")]
    Config(String),
}
