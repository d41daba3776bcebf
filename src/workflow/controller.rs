use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{RunStatus, Stage, StageInput, StageOutput, WorkflowState};
use crate::error::{GatewayError, PreconditionError, WorkflowError};
use crate::gateway::StageGateway;
use crate::language::Language;
use crate::media::VideoHandle;

/// One entry of the session's stage history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    pub stage: Stage,
    /// Target language when the run started
    pub language: Language,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    InFlight,
    Succeeded,
    Failed(String),
}

struct Session {
    state: WorkflowState,
    history: Vec<StageRun>,
}

/// Owns the workflow state of one session and runs stages against a gateway,
/// one at a time.
///
/// Operations take `&self` so the controller can be shared with a presentation
/// shell that keeps accepting input while a stage call is in flight. The lock
/// is only held for state transitions, never across the remote call.
pub struct WorkflowController {
    session_id: Uuid,
    gateway: Box<dyn StageGateway>,
    session: Mutex<Session>,
    updates: watch::Sender<WorkflowState>,
}

/// Marks the stage failed if the call future is dropped before it completes
struct RunGuard<'a> {
    controller: &'a WorkflowController,
    stage: Stage,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("[{}] {} call dropped before completion", self.controller.session_id, self.stage);
            let mut session = self.controller.lock();
            session.state.abandon(self.stage);
            finish_history(&mut session.history, self.stage, RunOutcome::Failed("abandoned".to_string()));
            self.controller.publish(&session.state);
        }
    }
}

fn finish_history(history: &mut [StageRun], stage: Stage, outcome: RunOutcome) {
    if let Some(run) = history
        .iter_mut()
        .rev()
        .find(|run| run.stage == stage && run.outcome == RunOutcome::InFlight)
    {
        run.finished_at = Some(Utc::now());
        run.outcome = outcome;
    }
}

impl WorkflowController {
    pub fn new(gateway: Box<dyn StageGateway>, target_language: Language) -> Self {
        let state = WorkflowState::new(target_language);
        let (updates, _) = watch::channel(state.clone());
        let session_id = Uuid::new_v4();

        info!("[{}] New workflow session, target language {}", session_id, target_language);

        Self {
            session_id,
            gateway,
            session: Mutex::new(Session {
                state,
                history: Vec::new(),
            }),
            updates,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> WorkflowState {
        self.lock().state.clone()
    }

    /// Receives a fresh snapshot after every state transition
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.updates.subscribe()
    }

    pub fn history(&self) -> Vec<StageRun> {
        self.lock().history.clone()
    }

    pub fn select_input(&self, video: VideoHandle) -> Result<WorkflowState, WorkflowError> {
        let mut session = self.lock();
        info!("[{}] Selecting input {}", self.session_id, video);
        session.state.select_input(video).map_err(|e| self.rejected("select input", e))?;
        self.publish(&session.state);
        Ok(session.state.clone())
    }

    pub fn select_language(&self, language: Language) -> Result<WorkflowState, WorkflowError> {
        let mut session = self.lock();
        info!("[{}] Selecting target language {} ({})", self.session_id, language, language.name());
        session
            .state
            .select_language(language)
            .map_err(|e| self.rejected("select language", e))?;
        if session.state.staleness().any() {
            debug!("[{}] Stale outputs after language change: {:?}", self.session_id, session.state.staleness());
        }
        self.publish(&session.state);
        Ok(session.state.clone())
    }

    pub async fn run_extract(&self) -> Result<WorkflowState, WorkflowError> {
        self.run_stage(Stage::Extract).await
    }

    pub async fn run_translate(&self) -> Result<WorkflowState, WorkflowError> {
        self.run_stage(Stage::Translate).await
    }

    pub async fn run_synthesize(&self) -> Result<WorkflowState, WorkflowError> {
        self.run_stage(Stage::Synthesize).await
    }

    pub async fn run_merge(&self) -> Result<WorkflowState, WorkflowError> {
        self.run_stage(Stage::Merge).await
    }

    /// Run a single stage: check preconditions, issue the one remote call and
    /// fold its result into the state. Never chains into the next stage.
    pub async fn run_stage(&self, stage: Stage) -> Result<WorkflowState, WorkflowError> {
        let (input, mut guard) = self.begin(stage)?;

        info!("[{}] Starting {} stage", self.session_id, stage);
        let outcome = self.call(input).await;
        guard.armed = false;

        let mut session = self.lock();
        let result = match &outcome {
            Ok(_) => {
                info!("[{}] {} stage completed", self.session_id, stage);
                finish_history(&mut session.history, stage, RunOutcome::Succeeded);
                Ok(())
            }
            Err(e) => {
                warn!("[{}] {} stage failed: {}", self.session_id, stage, e);
                finish_history(&mut session.history, stage, RunOutcome::Failed(e.to_string()));
                Err(WorkflowError::Gateway(e.clone()))
            }
        };
        session.state.complete(stage, outcome);
        self.publish(&session.state);
        result.map(|_| session.state.clone())
    }

    fn begin(&self, stage: Stage) -> Result<(StageInput, RunGuard<'_>), WorkflowError> {
        let mut session = self.lock();
        let input = session.state.begin(stage).map_err(|e| self.rejected(stage.name(), e))?;
        let language = session.state.target_language();
        session.history.push(StageRun {
            stage,
            language,
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::InFlight,
        });
        self.publish(&session.state);

        Ok((
            input,
            RunGuard {
                controller: self,
                stage,
                armed: true,
            },
        ))
    }

    async fn call(&self, input: StageInput) -> Result<StageOutput, GatewayError> {
        match input {
            StageInput::Extract { video } => {
                let output = self.gateway.extract(&video).await?;
                debug!("[{}] Transcript: {}", self.session_id, output.transcript);
                Ok(StageOutput::Extracted(output))
            }
            StageInput::Translate { transcript, language } => {
                let output = self.gateway.translate(&transcript, language).await?;
                debug!("[{}] Translation ({}): {}", self.session_id, language, output.translation);
                Ok(StageOutput::Translated { output, language })
            }
            StageInput::Synthesize { translation, language } => {
                let output = self.gateway.synthesize(&translation, language).await?;
                Ok(StageOutput::Synthesized { output, language })
            }
            StageInput::Merge { video, audio, language } => {
                let output = self.gateway.merge(&video, &audio).await?;
                Ok(StageOutput::Merged { output, language })
            }
        }
    }

    fn rejected(&self, operation: &str, error: PreconditionError) -> WorkflowError {
        warn!("[{}] Rejected {}: {}", self.session_id, operation, error);
        WorkflowError::Precondition(error)
    }

    fn publish(&self, state: &WorkflowState) {
        self.updates.send_replace(state.clone());
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_idle(&self) -> bool {
        !matches!(self.lock().state.run_status(), RunStatus::Running(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        ExtractOutput, MergeOutput, MockStageGateway, SynthesizeOutput, TranslateOutput,
    };
    use crate::media::MediaRef;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn controller(mock: MockStageGateway) -> WorkflowController {
        WorkflowController::new(Box::new(mock), Language::Es)
    }

    fn extract_ok(mock: &mut MockStageGateway) {
        mock.expect_extract().times(1).returning(|_| {
            Ok(ExtractOutput {
                audio: MediaRef::new("A1"),
                transcript: "hello".to_string(),
            })
        });
    }

    #[tokio::test]
    async fn test_extract_success() {
        let mut mock = MockStageGateway::new();
        extract_ok(&mut mock);
        let controller = controller(mock);

        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();
        let state = controller.run_extract().await.unwrap();

        assert_eq!(state.transcript(), Some("hello"));
        assert_eq!(state.run_status(), &RunStatus::Idle);
        assert_eq!(state.audio().map(|a| a.media().as_str()), Some("A1"));
    }

    #[tokio::test]
    async fn test_precondition_failure_makes_no_call() {
        let mut mock = MockStageGateway::new();
        mock.expect_extract().never();
        mock.expect_translate().never();
        mock.expect_synthesize().never();
        mock.expect_merge().never();
        let controller = controller(mock);

        assert_eq!(
            controller.run_extract().await,
            Err(WorkflowError::Precondition(PreconditionError::NoInput))
        );
        assert_eq!(
            controller.run_translate().await,
            Err(WorkflowError::Precondition(PreconditionError::NoTranscript))
        );
        assert_eq!(
            controller.run_synthesize().await,
            Err(WorkflowError::Precondition(PreconditionError::NoTranslation))
        );
        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();
        assert_eq!(
            controller.run_merge().await,
            Err(WorkflowError::Precondition(PreconditionError::NoSynthesizedAudio))
        );
        assert!(controller.history().is_empty());
    }

    #[tokio::test]
    async fn test_translate_uses_current_language() {
        let mut mock = MockStageGateway::new();
        extract_ok(&mut mock);
        mock.expect_translate()
            .with(eq("hello"), eq(Language::Fr))
            .times(1)
            .returning(|_, _| {
                Ok(TranslateOutput {
                    translation: "bonjour".to_string(),
                })
            });
        let controller = controller(mock);

        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();
        controller.run_extract().await.unwrap();
        controller.select_language(Language::Fr).unwrap();
        let state = controller.run_translate().await.unwrap();

        let translation = state.translation().unwrap();
        assert_eq!(translation.text, "bonjour");
        assert_eq!(translation.language, Language::Fr);
    }

    #[tokio::test]
    async fn test_gateway_failure_is_recorded_and_retryable() {
        let mut mock = MockStageGateway::new();
        let mut attempts = 0;
        mock.expect_extract().times(2).returning(move |_| {
            attempts += 1;
            if attempts == 1 {
                Err(GatewayError::Status {
                    stage: Stage::Extract,
                    status: 500,
                    body: "Error during FFmpeg processing".to_string(),
                })
            } else {
                Ok(ExtractOutput {
                    audio: MediaRef::new("A1"),
                    transcript: "hello".to_string(),
                })
            }
        });
        let controller = controller(mock);
        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();

        let err = controller.run_extract().await.unwrap_err();
        assert!(matches!(err, WorkflowError::Gateway(GatewayError::Status { status: 500, .. })));
        let state = controller.snapshot();
        assert!(state.transcript().is_none());
        assert_eq!(
            state.run_status(),
            &RunStatus::Failed {
                stage: Stage::Extract,
                message: "extract: service returned 500: Error during FFmpeg processing".to_string(),
            }
        );

        let state = controller.run_extract().await.unwrap();
        assert_eq!(state.transcript(), Some("hello"));

        let history = controller.history();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0].outcome, RunOutcome::Failed(_)));
        assert_eq!(history[1].outcome, RunOutcome::Succeeded);
        assert!(history.iter().all(|run| run.finished_at.is_some()));
    }

    #[tokio::test]
    async fn test_merge_failure_preserves_upstream_outputs() {
        let mut mock = MockStageGateway::new();
        extract_ok(&mut mock);
        mock.expect_translate().returning(|_, _| {
            Ok(TranslateOutput {
                translation: "hola".to_string(),
            })
        });
        mock.expect_synthesize()
            .with(eq("hola"), eq(Language::Es))
            .returning(|_, _| Ok(SynthesizeOutput { audio: MediaRef::new("A2") }));
        mock.expect_merge()
            .withf(|video, audio| video.path().ends_with("v1.mp4") && audio.as_str() == "A2")
            .returning(|_, _| {
                Err(GatewayError::Transport {
                    stage: Stage::Merge,
                    message: "connection reset".to_string(),
                })
            });
        let controller = controller(mock);

        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();
        controller.run_extract().await.unwrap();
        controller.run_translate().await.unwrap();
        let before = controller.run_synthesize().await.unwrap();

        assert!(controller.run_merge().await.is_err());
        let after = controller.snapshot();
        assert_eq!(after.transcript(), before.transcript());
        assert_eq!(after.translation(), before.translation());
        assert_eq!(after.audio(), before.audio());
        assert!(after.merged_output().is_none());
        assert!(matches!(after.run_status(), RunStatus::Failed { stage: Stage::Merge, .. }));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let mut mock = MockStageGateway::new();
        extract_ok(&mut mock);
        let controller = controller(mock);
        let mut updates = controller.subscribe();

        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();
        assert!(updates.has_changed().unwrap());
        assert_eq!(
            updates.borrow_and_update().selected_input(),
            Some(&VideoHandle::new("v1.mp4"))
        );

        controller.run_extract().await.unwrap();
        assert_eq!(updates.borrow_and_update().transcript(), Some("hello"));
    }

    /// Gateway whose extract call waits until released, for observing the
    /// running state from outside
    struct GatedGateway {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl StageGateway for GatedGateway {
        async fn extract(&self, _video: &VideoHandle) -> Result<ExtractOutput, GatewayError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(ExtractOutput {
                audio: MediaRef::new("A1"),
                transcript: "hello".to_string(),
            })
        }

        async fn translate(&self, _: &str, _: Language) -> Result<TranslateOutput, GatewayError> {
            Ok(TranslateOutput {
                translation: "hola".to_string(),
            })
        }

        async fn synthesize(&self, _: &str, _: Language) -> Result<SynthesizeOutput, GatewayError> {
            Ok(SynthesizeOutput { audio: MediaRef::new("A2") })
        }

        async fn merge(&self, _: &VideoHandle, _: &MediaRef) -> Result<MergeOutput, GatewayError> {
            Ok(MergeOutput {
                merged_video: MediaRef::new("M1"),
            })
        }
    }

    fn gated() -> (Arc<WorkflowController>, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gateway = GatedGateway {
            started: started.clone(),
            release: release.clone(),
        };
        let controller = Arc::new(WorkflowController::new(Box::new(gateway), Language::Es));
        (controller, started, release)
    }

    #[tokio::test]
    async fn test_single_flight_rejects_while_running() {
        let (controller, started, release) = gated();
        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();

        let running = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_extract().await })
        };
        started.notified().await;

        let before = controller.snapshot();
        assert_eq!(before.run_status(), &RunStatus::Running(Stage::Extract));
        assert!(!controller.is_idle());

        let busy = WorkflowError::Precondition(PreconditionError::Busy(Stage::Extract));
        assert_eq!(controller.run_extract().await, Err(busy.clone()));
        assert_eq!(controller.run_translate().await, Err(busy.clone()));
        assert_eq!(controller.run_merge().await, Err(busy.clone()));
        assert_eq!(controller.select_input(VideoHandle::new("v2.mp4")), Err(busy.clone()));
        assert_eq!(controller.select_language(Language::Fr), Err(busy));
        assert_eq!(controller.snapshot(), before);

        release.notify_one();
        let state = running.await.unwrap().unwrap();
        assert_eq!(state.transcript(), Some("hello"));
        assert_eq!(state.selected_input(), Some(&VideoHandle::new("v1.mp4")));
        assert!(controller.is_idle());
    }

    #[tokio::test]
    async fn test_dropped_call_does_not_leave_running() {
        let (controller, started, _release) = gated();
        controller.select_input(VideoHandle::new("v1.mp4")).unwrap();

        let running = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_extract().await })
        };
        started.notified().await;
        running.abort();
        let _ = running.await;

        let state = controller.snapshot();
        assert!(matches!(state.run_status(), RunStatus::Failed { stage: Stage::Extract, .. }));
        assert!(state.transcript().is_none());
        assert!(controller.is_idle());

        let history = controller.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RunOutcome::Failed("abandoned".to_string()));
    }
}
