pub mod entities;
pub mod messages;
pub mod ports;

pub use entities::{
    DeadLetterEntry, Job, JobSchema, JobStatus, JobTarget, SubmitOutcome, SubmitStatus,
    WorkerRecord, WorkerStatus,
};
pub use messages::{ControlMessage, JobStatusUpdate, WorkerHeartbeat};
pub use ports::{
    BrokerConnection, DeclareOptions, DeclareStatus, OrchestratorBackend, QueueKind,
};
