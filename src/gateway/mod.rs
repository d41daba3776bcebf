// Stage service boundary
//
// Each stage of the workflow is backed by one remote request/response call:
// - extract: upload the source video, receive original audio + transcript
// - translate: transcript + target language -> translated text
// - synthesize: translated text + language -> target-language audio
// - merge: source video + audio -> merged video
//
// Implementations hold no workflow state. The controller decides when a call
// may be issued and folds the result into its own state.

pub mod download;
pub mod http;
pub mod protocol;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

pub use download::MediaFetcher;
pub use http::HttpGateway;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::language::Language;
use crate::media::{MediaRef, VideoHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractOutput {
    /// Original-language audio track of the video
    pub audio: MediaRef,
    pub transcript: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateOutput {
    pub translation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizeOutput {
    pub audio: MediaRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutput {
    pub merged_video: MediaRef,
}

/// One-shot call per stage. Every call is safe to repeat.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StageGateway: Send + Sync {
    async fn extract(&self, video: &VideoHandle) -> std::result::Result<ExtractOutput, GatewayError>;

    async fn translate(
        &self,
        transcript: &str,
        target_language: Language,
    ) -> std::result::Result<TranslateOutput, GatewayError>;

    async fn synthesize(
        &self,
        translation: &str,
        language: Language,
    ) -> std::result::Result<SynthesizeOutput, GatewayError>;

    async fn merge(
        &self,
        video: &VideoHandle,
        audio: &MediaRef,
    ) -> std::result::Result<MergeOutput, GatewayError>;
}

/// Factory for creating gateway instances
pub struct GatewayFactory;

impl GatewayFactory {
    /// Create the HTTP gateway described by the configuration
    pub fn create_gateway(config: GatewayConfig) -> Result<Box<dyn StageGateway>> {
        Ok(Box::new(HttpGateway::new(config)?))
    }
}
