use thiserror::Error;

use crate::language::Language;
use crate::workflow::Stage;

/// A stage operation was refused before any remote call was issued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("no input video selected")]
    NoInput,

    #[error("no transcript available")]
    NoTranscript,

    #[error("no translation available")]
    NoTranslation,

    #[error("no synthesized audio available")]
    NoSynthesizedAudio,

    #[error("translation is out of date (produced for {produced_for}); translate again")]
    StaleTranslation { produced_for: Language },

    #[error("synthesized audio is out of date (produced for {produced_for}); synthesize again")]
    StaleAudio { produced_for: Language },

    #[error("stage '{0}' is still running")]
    Busy(Stage),
}

/// A remote stage service call did not produce a usable result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{stage}: cannot read input: {message}")]
    Input { stage: Stage, message: String },

    #[error("{stage}: request failed: {message}")]
    Transport { stage: Stage, message: String },

    #[error("{stage}: service returned {status}: {body}")]
    Status { stage: Stage, status: u16, body: String },

    #[error("{stage}: unexpected response: {message}")]
    Decode { stage: Stage, message: String },
}

impl GatewayError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Input { stage, .. }
            | Self::Transport { stage, .. }
            | Self::Status { stage, .. }
            | Self::Decode { stage, .. } => *stage,
        }
    }
}

/// Error returned by every controller operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Error, Debug)]
pub enum DubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Invalid command: {0}")]
    Command(String),
}

pub type Result<T> = std::result::Result<T, DubError>;
