// Segmentation workflow - stage machine plus the orchestrator that drives
// the backend through it.

pub mod machine;
pub mod state;

pub use machine::{AdvanceOutcome, WorkflowStateMachine};
pub use state::{
    Stage, StageTransition, WorkflowEvent, WorkflowSnapshot, WorkflowState,
    DEFAULT_STATUS_MESSAGE, GENERIC_FAILURE_MESSAGE,
};
