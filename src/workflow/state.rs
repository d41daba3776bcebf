use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatewayError, PreconditionError};
use crate::gateway::{ExtractOutput, MergeOutput, SynthesizeOutput, TranslateOutput};
use crate::language::Language;
use crate::media::{MediaRef, VideoHandle};

const ABANDONED_MESSAGE: &str = "stage call abandoned before completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Translate,
    Synthesize,
    Merge,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Extract, Stage::Translate, Stage::Synthesize, Stage::Merge];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Translate => "translate",
            Self::Synthesize => "synthesize",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Idle,
    Running(Stage),
    Failed { stage: Stage, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub text: String,
    pub language: Language,
}

/// The single audio slot: the extract stage's original-language track until
/// synthesis replaces it with target-language speech.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioTrack {
    Original(MediaRef),
    Synthesized { audio: MediaRef, language: Language },
}

impl AudioTrack {
    pub fn media(&self) -> &MediaRef {
        match self {
            Self::Original(audio) => audio,
            Self::Synthesized { audio, .. } => audio,
        }
    }

    pub fn is_synthesized(&self) -> bool {
        matches!(self, Self::Synthesized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedVideo {
    pub video: MediaRef,
    pub language: Language,
}

/// Derived outputs that no longer match the current target language or their
/// upstream input. Stale outputs stay visible but are not fed downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staleness {
    pub translation: bool,
    pub audio: bool,
    pub merged_output: bool,
}

impl Staleness {
    pub fn any(&self) -> bool {
        self.translation || self.audio || self.merged_output
    }
}

/// Everything a stage call needs, captured when the stage starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput {
    Extract { video: VideoHandle },
    Translate { transcript: String, language: Language },
    Synthesize { translation: String, language: Language },
    Merge { video: VideoHandle, audio: MediaRef, language: Language },
}

/// Successful stage result, tagged with the language it was produced for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Extracted(ExtractOutput),
    Translated { output: TranslateOutput, language: Language },
    Synthesized { output: SynthesizeOutput, language: Language },
    Merged { output: MergeOutput, language: Language },
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Extracted(_) => Stage::Extract,
            Self::Translated { .. } => Stage::Translate,
            Self::Synthesized { .. } => Stage::Synthesize,
            Self::Merged { .. } => Stage::Merge,
        }
    }
}

/// Current stage outputs of one session. Only the controller mutates it; the
/// presentation side works on cloned snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    selected_input: Option<VideoHandle>,
    target_language: Language,
    transcript: Option<String>,
    translation: Option<Translation>,
    audio: Option<AudioTrack>,
    merged_output: Option<MergedVideo>,
    /// Outputs whose upstream stage has produced a newer result since.
    /// Language mismatch is derived on demand, not stored.
    superseded: Staleness,
    run_status: RunStatus,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new(Language::default())
    }
}

impl WorkflowState {
    pub fn new(target_language: Language) -> Self {
        Self {
            selected_input: None,
            target_language,
            transcript: None,
            translation: None,
            audio: None,
            merged_output: None,
            superseded: Staleness::default(),
            run_status: RunStatus::Idle,
        }
    }

    pub fn selected_input(&self) -> Option<&VideoHandle> {
        self.selected_input.as_ref()
    }

    pub fn target_language(&self) -> Language {
        self.target_language
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    pub fn translation(&self) -> Option<&Translation> {
        self.translation.as_ref()
    }

    pub fn audio(&self) -> Option<&AudioTrack> {
        self.audio.as_ref()
    }

    /// Target-language audio, if synthesis has produced it
    pub fn synthesized_audio(&self) -> Option<&MediaRef> {
        match &self.audio {
            Some(AudioTrack::Synthesized { audio, .. }) => Some(audio),
            _ => None,
        }
    }

    pub fn merged_output(&self) -> Option<&MergedVideo> {
        self.merged_output.as_ref()
    }

    pub fn staleness(&self) -> Staleness {
        let target = self.target_language;
        let audio = match &self.audio {
            Some(AudioTrack::Synthesized { language, .. }) => self.superseded.audio || *language != target,
            _ => false,
        };
        Staleness {
            translation: self
                .translation
                .as_ref()
                .is_some_and(|t| self.superseded.translation || t.language != target),
            audio,
            merged_output: self
                .merged_output
                .as_ref()
                .is_some_and(|m| self.superseded.merged_output || m.language != target),
        }
    }

    pub fn run_status(&self) -> &RunStatus {
        &self.run_status
    }

    fn ensure_idle(&self) -> Result<(), PreconditionError> {
        match self.run_status {
            RunStatus::Running(stage) => Err(PreconditionError::Busy(stage)),
            _ => Ok(()),
        }
    }

    /// Point the session at a new video. Every stage output belongs to the old
    /// input, so all of them go.
    pub(crate) fn select_input(&mut self, video: VideoHandle) -> Result<(), PreconditionError> {
        self.ensure_idle()?;
        *self = Self {
            selected_input: Some(video),
            ..Self::new(self.target_language)
        };
        Ok(())
    }

    /// Change the target language. The transcript is language independent and
    /// stays valid; language-bound outputs are kept and read as stale while
    /// their language differs from the target.
    pub(crate) fn select_language(&mut self, language: Language) -> Result<(), PreconditionError> {
        self.ensure_idle()?;
        self.target_language = language;
        Ok(())
    }

    /// Check the stage's preconditions and, if they hold, mark it running.
    pub(crate) fn begin(&mut self, stage: Stage) -> Result<StageInput, PreconditionError> {
        self.ensure_idle()?;
        let input = self.stage_input(stage)?;
        self.run_status = RunStatus::Running(stage);
        Ok(input)
    }

    fn stage_input(&self, stage: Stage) -> Result<StageInput, PreconditionError> {
        let language = self.target_language;
        let staleness = self.staleness();
        match stage {
            Stage::Extract => {
                let video = self.selected_input.clone().ok_or(PreconditionError::NoInput)?;
                Ok(StageInput::Extract { video })
            }
            Stage::Translate => {
                let transcript = self.transcript.clone().ok_or(PreconditionError::NoTranscript)?;
                Ok(StageInput::Translate { transcript, language })
            }
            Stage::Synthesize => {
                let translation = self.translation.as_ref().ok_or(PreconditionError::NoTranslation)?;
                if staleness.translation {
                    return Err(PreconditionError::StaleTranslation {
                        produced_for: translation.language,
                    });
                }
                Ok(StageInput::Synthesize {
                    translation: translation.text.clone(),
                    language,
                })
            }
            Stage::Merge => {
                let video = self.selected_input.clone().ok_or(PreconditionError::NoInput)?;
                let (audio, produced_for) = match &self.audio {
                    Some(AudioTrack::Synthesized { audio, language }) => (audio.clone(), *language),
                    _ => return Err(PreconditionError::NoSynthesizedAudio),
                };
                if staleness.audio {
                    return Err(PreconditionError::StaleAudio { produced_for });
                }
                Ok(StageInput::Merge {
                    video,
                    audio,
                    language: produced_for,
                })
            }
        }
    }

    /// Fold a finished call into the state. Success sets all of the stage's
    /// outputs at once; failure touches nothing but the run status.
    pub(crate) fn complete(&mut self, stage: Stage, outcome: Result<StageOutput, GatewayError>) {
        if self.run_status != RunStatus::Running(stage) {
            return;
        }

        match outcome {
            Ok(output) => {
                self.apply(output);
                self.run_status = RunStatus::Idle;
            }
            Err(e) => {
                self.run_status = RunStatus::Failed {
                    stage,
                    message: e.to_string(),
                };
            }
        }
    }

    /// Record that a running stage was dropped without a result
    pub(crate) fn abandon(&mut self, stage: Stage) {
        if self.run_status == RunStatus::Running(stage) {
            self.run_status = RunStatus::Failed {
                stage,
                message: ABANDONED_MESSAGE.to_string(),
            };
        }
    }

    fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::Extracted(extracted) => {
                self.transcript = Some(extracted.transcript);
                self.audio = Some(AudioTrack::Original(extracted.audio));
                self.superseded.audio = false;
                self.superseded.translation |= self.translation.is_some();
                self.superseded.merged_output |= self.merged_output.is_some();
            }
            StageOutput::Translated { output, language } => {
                self.translation = Some(Translation {
                    text: output.translation,
                    language,
                });
                self.superseded.translation = false;
                self.superseded.audio |= self.audio.as_ref().is_some_and(AudioTrack::is_synthesized);
                self.superseded.merged_output |= self.merged_output.is_some();
            }
            StageOutput::Synthesized { output, language } => {
                self.audio = Some(AudioTrack::Synthesized {
                    audio: output.audio,
                    language,
                });
                self.superseded.audio = false;
                self.superseded.merged_output |= self.merged_output.is_some();
            }
            StageOutput::Merged { output, language } => {
                self.merged_output = Some(MergedVideo {
                    video: output.merged_video,
                    language,
                });
                self.superseded.merged_output = false;
            }
        }
    }
}
