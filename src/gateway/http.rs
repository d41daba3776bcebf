use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::protocol::{
    ExtractResponse, MergeRequest, MergeResponse, SynthesizeRequest, SynthesizeResponse,
    TranslateRequest, TranslateResponse,
};
use super::{ExtractOutput, MergeOutput, StageGateway, SynthesizeOutput, TranslateOutput};
use crate::config::GatewayConfig;
use crate::error::{DubError, GatewayError, Result};
use crate::language::Language;
use crate::media::{MediaRef, VideoHandle};
use crate::workflow::Stage;

/// Stage services reached over HTTP + JSON
pub struct HttpGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        // No overall request timeout: a slow stage service keeps the stage running.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(DubError::Http)?;

        Ok(Self { client, config })
    }

    /// Send a request and decode a 2xx JSON body. Anything else keeps the raw
    /// diagnostic text.
    async fn exchange<T: DeserializeOwned>(
        &self,
        stage: Stage,
        request: RequestBuilder,
    ) -> std::result::Result<T, GatewayError> {
        let response = request.send().await.map_err(|e| GatewayError::Transport {
            stage,
            message: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| GatewayError::Transport {
            stage,
            message: format!("failed to read response body: {}", e),
        })?;

        debug!("{} responded {}: {}", stage, status, body);

        if !status.is_success() {
            return Err(GatewayError::Status {
                stage,
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Decode {
            stage,
            message: format!("{} (body: {})", e, body),
        })
    }

    fn post(&self, stage: Stage, path: &str) -> RequestBuilder {
        let url = self.config.endpoint_url(path);
        debug!("Sending {} request to: {}", stage, url);
        self.client.post(url)
    }
}

#[async_trait]
impl StageGateway for HttpGateway {
    async fn extract(&self, video: &VideoHandle) -> std::result::Result<ExtractOutput, GatewayError> {
        let stage = Stage::Extract;
        let bytes = tokio::fs::read(video.path()).await.map_err(|e| GatewayError::Input {
            stage,
            message: format!("{}: {}", video, e),
        })?;

        debug!("Uploading {} ({} bytes, {})", video.file_name(), bytes.len(), video.mime_type());

        let part = Part::bytes(bytes)
            .file_name(video.file_name())
            .mime_str(video.mime_type())
            .map_err(|e| GatewayError::Input {
                stage,
                message: e.to_string(),
            })?;
        let form = Form::new().part("video", part);

        let response: ExtractResponse = self
            .exchange(stage, self.post(stage, &self.config.extract_path).multipart(form))
            .await?;

        Ok(ExtractOutput {
            audio: MediaRef::new(response.audio_path),
            transcript: response.transcription,
        })
    }

    async fn translate(
        &self,
        transcript: &str,
        target_language: Language,
    ) -> std::result::Result<TranslateOutput, GatewayError> {
        let stage = Stage::Translate;
        let request = TranslateRequest {
            transcription: transcript.to_string(),
            target_language: target_language.code().to_string(),
        };

        let response: TranslateResponse = self
            .exchange(stage, self.post(stage, &self.config.translate_path).json(&request))
            .await?;

        if let Some(file_path) = &response.file_path {
            debug!("Service stored translation at {}", file_path);
        }

        Ok(TranslateOutput {
            translation: response.translated_text,
        })
    }

    async fn synthesize(
        &self,
        translation: &str,
        language: Language,
    ) -> std::result::Result<SynthesizeOutput, GatewayError> {
        let stage = Stage::Synthesize;
        let request = SynthesizeRequest {
            translated_text: translation.to_string(),
            language: language.code().to_string(),
        };

        let response: SynthesizeResponse = self
            .exchange(stage, self.post(stage, &self.config.synthesize_path).json(&request))
            .await?;

        Ok(SynthesizeOutput {
            audio: MediaRef::new(response.audio_file_path),
        })
    }

    async fn merge(
        &self,
        video: &VideoHandle,
        audio: &MediaRef,
    ) -> std::result::Result<MergeOutput, GatewayError> {
        let stage = Stage::Merge;
        let request = MergeRequest {
            video_path: video.path().to_string_lossy().to_string(),
            audio_path: audio.as_str().to_string(),
        };

        let response: MergeResponse = self
            .exchange(stage, self.post(stage, &self.config.merge_path).json(&request))
            .await?;

        Ok(MergeOutput {
            merged_video: MediaRef::new(response.merged_video_path),
        })
    }
}
