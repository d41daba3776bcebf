// Workflow core
//
// - state: the session data model and its pure transitions
// - controller: single-flight stage execution on top of a StageGateway

pub mod controller;
pub mod state;

pub use controller::{RunOutcome, StageRun, WorkflowController};
pub use state::{
    AudioTrack, MergedVideo, RunStatus, Stage, StageInput, StageOutput, Staleness, Translation,
    WorkflowState,
};
