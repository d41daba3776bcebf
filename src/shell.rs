//! Presentation wiring: a line-oriented session on top of the controller and
//! plain-text rendering of workflow snapshots.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{DubError, PreconditionError, Result, WorkflowError};
use crate::gateway::MediaFetcher;
use crate::language::Language;
use crate::media::VideoHandle;
use crate::workflow::{AudioTrack, RunOutcome, RunStatus, Stage, StageRun, WorkflowController, WorkflowState};

const HELP: &str = "\
Commands:
  open <path>     select the source video (clears all results)
  lang <code>     select the target language (en, es, fr, de, it, zh, ja)
  extract         extract and transcribe the audio
  translate       translate the transcription
  synthesize      generate audio from the translation
  merge           merge the generated audio with the video
  status          show the current results
  history         show stage runs of this session
  save <path>     download the merged video
  help            show this help
  quit            leave the session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Open(PathBuf),
    Language(Language),
    Run(Stage),
    Status,
    History,
    Save(PathBuf),
    Help,
    Quit,
}

impl FromStr for ShellCommand {
    type Err = DubError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let needs_argument = |what: &str| {
            if rest.is_empty() {
                Err(DubError::Command(format!("'{}' needs {}", word, what)))
            } else {
                Ok(rest)
            }
        };

        match word.to_lowercase().as_str() {
            "open" => Ok(Self::Open(PathBuf::from(needs_argument("a video path")?))),
            "lang" | "language" => Ok(Self::Language(needs_argument("a language code")?.parse()?)),
            "extract" => Ok(Self::Run(Stage::Extract)),
            "translate" => Ok(Self::Run(Stage::Translate)),
            "synthesize" | "tts" => Ok(Self::Run(Stage::Synthesize)),
            "merge" => Ok(Self::Run(Stage::Merge)),
            "status" => Ok(Self::Status),
            "history" => Ok(Self::History),
            "save" => Ok(Self::Save(PathBuf::from(needs_argument("a destination path")?))),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            _ => Err(DubError::Command(format!("unknown command '{}'; try 'help'", word))),
        }
    }
}

/// Message shown while a stage is running
pub fn progress_message(stage: Stage, language: Language) -> String {
    match stage {
        Stage::Extract => "Processing video and extracting audio...".to_string(),
        Stage::Translate => "Translating transcription...".to_string(),
        Stage::Synthesize => format!("Converting translated text to audio ({})...", language),
        Stage::Merge => "Merging audio with video...".to_string(),
    }
}

pub fn success_message(stage: Stage, language: Language) -> String {
    match stage {
        Stage::Extract => "Audio extracted and transcribed successfully.".to_string(),
        Stage::Translate => format!("Translation completed successfully ({}).", language),
        Stage::Synthesize => format!("Text-to-Audio conversion successful ({}).", language),
        Stage::Merge => "Audio and video merged successfully.".to_string(),
    }
}

pub fn failure_message(stage: Stage, detail: &str) -> String {
    let what = match stage {
        Stage::Extract => "Audio extraction failed",
        Stage::Translate => "Translation failed",
        Stage::Synthesize => "Text-to-Audio conversion failed",
        Stage::Merge => "Merging failed",
    };
    format!("{}: {}", what, detail)
}

/// What the user should do to satisfy a refused operation
pub fn corrective_hint(error: &PreconditionError) -> String {
    match error {
        PreconditionError::NoInput => "Please open a video file first.".to_string(),
        PreconditionError::NoTranscript => "Please extract and transcribe the audio first.".to_string(),
        PreconditionError::NoTranslation => "Please translate the transcription first.".to_string(),
        PreconditionError::NoSynthesizedAudio => "Please generate the translated audio before merging.".to_string(),
        PreconditionError::StaleTranslation { produced_for } => {
            format!("The translation is out of date ({}). Please translate again.", produced_for)
        }
        PreconditionError::StaleAudio { produced_for } => {
            format!("The generated audio is out of date ({}). Please synthesize again.", produced_for)
        }
        PreconditionError::Busy(stage) => format!("Still running {}. Please wait for it to finish.", stage),
    }
}

/// Tracks how much of the stage history has been reported. Every run gets a
/// progress message when it shows up and an outcome message once it ends.
#[derive(Debug, Default)]
pub struct RunReporter {
    started: usize,
    finished: usize,
}

impl RunReporter {
    /// Messages for history entries not reported yet, in order
    pub fn advance(&mut self, history: &[StageRun]) -> Vec<String> {
        let mut messages = Vec::new();
        for (index, run) in history.iter().enumerate().skip(self.finished) {
            if index >= self.started {
                messages.push(progress_message(run.stage, run.language));
                self.started = index + 1;
            }
            match &run.outcome {
                RunOutcome::InFlight => break,
                RunOutcome::Succeeded => messages.push(success_message(run.stage, run.language)),
                RunOutcome::Failed(message) => messages.push(failure_message(run.stage, message)),
            }
            self.finished = index + 1;
        }
        messages
    }
}

fn stale_marker(stale: bool) -> &'static str {
    if stale { " (stale)" } else { "" }
}

pub fn render_status(state: &WorkflowState) -> String {
    let staleness = state.staleness();
    let mut out = String::new();

    let input = state
        .selected_input()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "(none)".to_string());
    let _ = writeln!(out, "Input:       {}", input);
    let language = state.target_language();
    let _ = writeln!(out, "Language:    {} ({})", language, language.name());

    let status = match state.run_status() {
        RunStatus::Idle => "idle".to_string(),
        RunStatus::Running(stage) => format!("running {}", stage),
        RunStatus::Failed { stage, message } => format!("{} failed: {}", stage, message),
    };
    let _ = writeln!(out, "Status:      {}", status);

    if let Some(transcript) = state.transcript() {
        let _ = writeln!(out, "Transcript:  {}", transcript);
    }
    if let Some(translation) = state.translation() {
        let _ = writeln!(
            out,
            "Translation: {} [{}]{}",
            translation.text,
            translation.language,
            stale_marker(staleness.translation)
        );
    }
    match state.audio() {
        Some(AudioTrack::Original(audio)) => {
            let _ = writeln!(out, "Audio:       {} [original]", audio);
        }
        Some(AudioTrack::Synthesized { audio, language }) => {
            let _ = writeln!(out, "Audio:       {} [{}]{}", audio, language, stale_marker(staleness.audio));
        }
        None => {}
    }
    if let Some(merged) = state.merged_output() {
        let _ = writeln!(
            out,
            "Merged:      {} [{}]{}",
            merged.video,
            merged.language,
            stale_marker(staleness.merged_output)
        );
    }

    out
}

pub fn render_history(history: &[StageRun]) -> String {
    if history.is_empty() {
        return "No stages run in this session.\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<10} {:<10} {}", "Stage", "Started", "Duration", "Outcome");
    let _ = writeln!(out, "{}", "-".repeat(60));
    for run in history {
        let duration = run
            .finished_at
            .map(|end| format!("{:.1}s", (end - run.started_at).num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        let outcome = match &run.outcome {
            RunOutcome::InFlight => "running".to_string(),
            RunOutcome::Succeeded => "ok".to_string(),
            RunOutcome::Failed(message) => format!("failed: {}", message),
        };
        let _ = writeln!(
            out,
            "{:<12} {:<10} {:<10} {}",
            run.stage.name(),
            run.started_at.format("%H:%M:%S"),
            duration,
            outcome
        );
    }
    out
}

/// Prints stage progress whenever a snapshot is published. Reads the full
/// history each time, so runs that start and end between two notifications
/// are still reported.
async fn render_updates(controller: Arc<WorkflowController>, mut shutdown: oneshot::Receiver<()>) {
    let mut updates = controller.subscribe();
    let mut reporter = RunReporter::default();
    loop {
        let stop = tokio::select! {
            changed = updates.changed() => changed.is_err(),
            _ = &mut shutdown => true,
        };
        for message in reporter.advance(&controller.history()) {
            println!("{}", message);
        }
        if stop {
            break;
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

/// Interactive session. Stage commands run as background tasks so the
/// session keeps reading input; the controller rejects anything that would
/// overlap the running stage.
pub struct Shell {
    controller: Arc<WorkflowController>,
    fetcher: MediaFetcher,
    tasks: JoinSet<()>,
}

impl Shell {
    pub fn new(controller: Arc<WorkflowController>, fetcher: MediaFetcher) -> Self {
        Self {
            controller,
            fetcher,
            tasks: JoinSet::new(),
        }
    }

    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, reader: R) -> Result<()> {
        info!("Interactive session {} started", self.controller.session_id());
        println!("{}", HELP);

        let (stop_renderer, shutdown) = oneshot::channel();
        let renderer = tokio::spawn(render_updates(self.controller.clone(), shutdown));
        let mut lines = reader.lines();

        loop {
            print!("> ");
            let _ = std::io::stdout().flush();

            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<ShellCommand>() {
                        Ok(command) => {
                            if let Flow::Quit = self.execute(command).await? {
                                break;
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Stage task ended abnormally: {}", e);
                    }
                }
            }
        }

        // Stage calls are never cancelled; let the running one finish
        if !self.controller.is_idle() {
            println!("Waiting for the running stage to finish...");
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Stage task ended abnormally: {}", e);
            }
        }
        let _ = stop_renderer.send(());
        if let Err(e) = renderer.await {
            warn!("Progress renderer ended abnormally: {}", e);
        }

        info!("Interactive session {} ended", self.controller.session_id());
        Ok(())
    }

    async fn execute(&mut self, command: ShellCommand) -> Result<Flow> {
        match command {
            ShellCommand::Open(path) => {
                if !path.is_file() {
                    println!("File not found: {}", path.display());
                } else {
                    report(self.controller.select_input(VideoHandle::new(path)));
                }
            }
            ShellCommand::Language(language) => {
                if let Some(state) = report(self.controller.select_language(language)) {
                    if state.staleness().any() {
                        println!("Existing results were produced for another language and are marked stale.");
                    }
                }
            }
            ShellCommand::Run(stage) => {
                let controller = self.controller.clone();
                self.tasks.spawn(async move {
                    if let Err(WorkflowError::Precondition(e)) = controller.run_stage(stage).await {
                        println!("{}", corrective_hint(&e));
                    }
                });
            }
            ShellCommand::Status => print!("{}", render_status(&self.controller.snapshot())),
            ShellCommand::History => print!("{}", render_history(&self.controller.history())),
            ShellCommand::Save(dest) => {
                if let Err(e) = save_merged(&self.controller.snapshot(), &self.fetcher, &dest).await {
                    println!("{}", e);
                }
            }
            ShellCommand::Help => println!("{}", HELP),
            ShellCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }
}

fn report(result: std::result::Result<WorkflowState, WorkflowError>) -> Option<WorkflowState> {
    match result {
        Ok(state) => Some(state),
        Err(WorkflowError::Precondition(e)) => {
            println!("{}", corrective_hint(&e));
            None
        }
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}

/// Download the merged video of `state` to `dest`
pub async fn save_merged(state: &WorkflowState, fetcher: &MediaFetcher, dest: &Path) -> Result<PathBuf> {
    let merged = state
        .merged_output()
        .ok_or_else(|| DubError::Download("no merged video available".to_string()))?;
    if state.staleness().merged_output {
        warn!("Saving a merged video produced for {}", merged.language);
    }
    let path = fetcher.download(&merged.video, dest).await?;
    println!("Saved merged video to {}", path.display());
    Ok(path)
}

/// Non-interactive run: one user action per stage, issued in order, stopping
/// at the first failure.
pub async fn run_once(
    controller: &WorkflowController,
    fetcher: &MediaFetcher,
    input: &Path,
    language: Language,
    output: Option<&Path>,
) -> Result<WorkflowState> {
    if !input.is_file() {
        return Err(DubError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("input video not found: {}", input.display()),
        )));
    }

    controller.select_input(VideoHandle::new(input))?;
    controller.select_language(language)?;

    let mut state = controller.snapshot();
    for stage in Stage::ALL {
        println!("{}", progress_message(stage, language));
        state = match controller.run_stage(stage).await {
            Ok(state) => state,
            Err(WorkflowError::Gateway(e)) => {
                println!("{}", failure_message(stage, &e.to_string()));
                return Err(WorkflowError::Gateway(e).into());
            }
            Err(e) => return Err(e.into()),
        };
        println!("{}", success_message(stage, language));
    }

    if let Some(merged) = state.merged_output() {
        println!("Merged video: {}", merged.video);
    }
    if let Some(dest) = output {
        save_merged(&state, fetcher, dest).await?;
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::error::GatewayError;
    use crate::gateway::{ExtractOutput, MockStageGateway};
    use crate::media::MediaRef;
    use chrono::Utc;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "open /videos/talk.mp4".parse::<ShellCommand>().unwrap(),
            ShellCommand::Open(PathBuf::from("/videos/talk.mp4"))
        );
        assert_eq!(
            "open  my clip.mov ".parse::<ShellCommand>().unwrap(),
            ShellCommand::Open(PathBuf::from("my clip.mov"))
        );
        assert_eq!("lang fr".parse::<ShellCommand>().unwrap(), ShellCommand::Language(Language::Fr));
        assert_eq!("EXTRACT".parse::<ShellCommand>().unwrap(), ShellCommand::Run(Stage::Extract));
        assert_eq!("tts".parse::<ShellCommand>().unwrap(), ShellCommand::Run(Stage::Synthesize));
        assert_eq!("merge".parse::<ShellCommand>().unwrap(), ShellCommand::Run(Stage::Merge));
        assert_eq!("exit".parse::<ShellCommand>().unwrap(), ShellCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("open".parse::<ShellCommand>(), Err(DubError::Command(_))));
        assert!(matches!("lang pt".parse::<ShellCommand>(), Err(DubError::UnsupportedLanguage(_))));
        assert!(matches!("dance".parse::<ShellCommand>(), Err(DubError::Command(_))));
    }

    fn stage_run(stage: Stage, outcome: RunOutcome) -> StageRun {
        StageRun {
            stage,
            language: Language::Fr,
            started_at: Utc::now(),
            finished_at: None,
            outcome,
        }
    }

    #[test]
    fn test_reporter_catches_up_on_missed_transitions() {
        let mut reporter = RunReporter::default();
        let mut history = vec![stage_run(Stage::Extract, RunOutcome::InFlight)];
        assert_eq!(
            reporter.advance(&history),
            vec!["Processing video and extracting audio...".to_string()]
        );
        assert!(reporter.advance(&history).is_empty());

        // Extract finished and translate started before the next poll
        history[0].outcome = RunOutcome::Succeeded;
        history.push(stage_run(Stage::Translate, RunOutcome::InFlight));
        assert_eq!(
            reporter.advance(&history),
            vec![
                "Audio extracted and transcribed successfully.".to_string(),
                "Translating transcription...".to_string(),
            ]
        );

        history[1].outcome = RunOutcome::Failed("translate: request failed: refused".to_string());
        history.push(stage_run(Stage::Synthesize, RunOutcome::Succeeded));
        assert_eq!(
            reporter.advance(&history),
            vec![
                "Translation failed: translate: request failed: refused".to_string(),
                "Converting translated text to audio (fr)...".to_string(),
                "Text-to-Audio conversion successful (fr).".to_string(),
            ]
        );
        assert!(reporter.advance(&history).is_empty());
    }

    fn mock_with_extract() -> MockStageGateway {
        let mut mock = MockStageGateway::new();
        mock.expect_extract().times(1).returning(|_| {
            Ok(ExtractOutput {
                audio: MediaRef::new("A1"),
                transcript: "hello".to_string(),
            })
        });
        mock
    }

    fn fetcher() -> MediaFetcher {
        MediaFetcher::new(&GatewayConfig::default()).unwrap().with_progress(false)
    }

    fn video_file() -> tempfile::NamedTempFile {
        tempfile::Builder::new().suffix(".mp4").tempfile().unwrap()
    }

    #[tokio::test]
    async fn test_run_once_stops_at_first_failure() {
        let mut mock = mock_with_extract();
        mock.expect_translate().times(1).returning(|_, _| {
            Err(GatewayError::Transport {
                stage: Stage::Translate,
                message: "connection refused".to_string(),
            })
        });
        mock.expect_synthesize().never();
        mock.expect_merge().never();
        let controller = WorkflowController::new(Box::new(mock), Language::Es);
        let video = video_file();

        let result = run_once(&controller, &fetcher(), video.path(), Language::De, None).await;
        assert!(matches!(
            result,
            Err(DubError::Workflow(WorkflowError::Gateway(GatewayError::Transport {
                stage: Stage::Translate,
                ..
            })))
        ));

        let state = controller.snapshot();
        assert_eq!(state.target_language(), Language::De);
        assert_eq!(state.transcript(), Some("hello"));
        assert!(state.translation().is_none());
        assert!(matches!(state.run_status(), RunStatus::Failed { stage: Stage::Translate, .. }));
    }

    #[tokio::test]
    async fn test_run_once_requires_existing_input() {
        let mut mock = MockStageGateway::new();
        mock.expect_extract().never();
        let controller = WorkflowController::new(Box::new(mock), Language::Es);

        let result = run_once(&controller, &fetcher(), Path::new("/no/such/video.mp4"), Language::Fr, None).await;
        assert!(matches!(result, Err(DubError::Io(_))));
        assert!(controller.snapshot().selected_input().is_none());
    }

    #[tokio::test]
    async fn test_shell_script_runs_stage_to_completion() {
        let controller = Arc::new(WorkflowController::new(Box::new(mock_with_extract()), Language::Es));
        let video = video_file();
        let script = format!("open {}\nlang fr\nbogus\nextract\nquit\n", video.path().display());

        let mut shell = Shell::new(controller.clone(), fetcher());
        shell.run(BufReader::new(script.as_bytes())).await.unwrap();

        // quit waits for the spawned extract call
        let state = controller.snapshot();
        assert_eq!(state.selected_input().map(VideoHandle::path), Some(video.path()));
        assert_eq!(state.target_language(), Language::Fr);
        assert_eq!(state.transcript(), Some("hello"));
        assert_eq!(state.run_status(), &RunStatus::Idle);
        assert_eq!(controller.history().len(), 1);
    }

    #[tokio::test]
    async fn test_shell_ignores_missing_video() {
        let mut mock = MockStageGateway::new();
        mock.expect_extract().never();
        let controller = Arc::new(WorkflowController::new(Box::new(mock), Language::Es));

        let mut shell = Shell::new(controller.clone(), fetcher());
        let script = "open /no/such/video.mp4\nextract\n";
        shell.run(BufReader::new(script.as_bytes())).await.unwrap();

        assert!(controller.snapshot().selected_input().is_none());
        assert!(controller.history().is_empty());
    }

    #[test]
    fn test_render_status_marks_stale() {
        let mut state = WorkflowState::new(Language::Fr);
        state.select_input(VideoHandle::new("v1.mp4")).unwrap();
        state.begin(Stage::Extract).unwrap();
        state.complete(
            Stage::Extract,
            Ok(crate::workflow::StageOutput::Extracted(ExtractOutput {
                audio: MediaRef::new("A1"),
                transcript: "hello".to_string(),
            })),
        );
        state.begin(Stage::Translate).unwrap();
        state.complete(
            Stage::Translate,
            Ok(crate::workflow::StageOutput::Translated {
                output: crate::gateway::TranslateOutput {
                    translation: "bonjour".to_string(),
                },
                language: Language::Fr,
            }),
        );

        let rendered = render_status(&state);
        assert!(rendered.contains("Input:       v1.mp4"));
        assert!(rendered.contains("Transcript:  hello"));
        assert!(rendered.contains("Translation: bonjour [fr]\n"));
        assert!(rendered.contains("Audio:       A1 [original]"));

        state.select_language(Language::De).unwrap();
        let rendered = render_status(&state);
        assert!(rendered.contains("Language:    de (German)"));
        assert!(rendered.contains("Translation: bonjour [fr] (stale)"));
    }

    #[test]
    fn test_corrective_hints() {
        assert_eq!(
            corrective_hint(&PreconditionError::NoTranscript),
            "Please extract and transcribe the audio first."
        );
        assert_eq!(
            corrective_hint(&PreconditionError::Busy(Stage::Merge)),
            "Still running merge. Please wait for it to finish."
        );
    }

    #[test]
    fn test_render_empty_history() {
        assert_eq!(render_history(&[]), "No stages run in this session.\n");
    }
}
