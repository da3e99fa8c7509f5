pub mod coordinator;
pub mod driver;
pub mod error;
pub mod executor;
pub mod position;
pub mod recovery;
pub mod registry;
pub mod runtime;
pub mod script;

pub use coordinator::{
    Command, CommandKind, CommandReply, Coordinator, ScanReport, SkippedSession, StopScope,
};
pub use driver::{
    AgentDriver, CompletionStatus, DriverError, DriverFuture, OpenSession, ReloadOutcome, Role,
    SessionProvider, SessionRef, Sink, Transcript, TranscriptMessage,
};
pub use error::{CoordinatorError, FailureKind, StepFailure};
pub use executor::{DecisionHub, Outcome, ResumePoint, StepExecutor};
pub use position::{Detection, MatchMethod, PositionDetector, UnmatchedReason};
pub use recovery::{resolve_resume_point, RecoveryController, RecoveryOutcome};
pub use registry::{
    Decision, DecisionRecord, Inconsistency, JsonFileStore, MemoryStore, RecoveryState, Run,
    RunPatch, RunRegistry, RunStatus, RunStore, StepPhase,
};
pub use runtime::config::{CoordinatorConfig, CoordinatorConfigBuilder};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use script::{Script, ScriptCatalog, SignatureCatalog, Step};
