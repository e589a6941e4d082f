pub mod connection;
pub mod messaging;

pub use connection::BrokerConnection;
pub use messaging::{DeclareOptions, DeclareStatus, OrchestratorBackend, QueueKind};
