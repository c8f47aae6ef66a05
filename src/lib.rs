pub mod agent;
pub mod config;
pub mod error;
pub mod identity;
pub mod intake;
pub mod ledger;
pub mod node;
pub mod pipeline;
pub mod registration;
pub mod session;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AgentError, Disposition, Result};
pub use identity::AgentIdentity;
pub use intake::{CommandIntakeLoop, IntakeStats};
pub use ledger::{EventFilter, EventSubscription, InMemoryLedger, LedgerGateway, RpcLedgerGateway};
pub use pipeline::{CommandEnvelope, ExecutionPipeline, ResultEnvelope};
pub use registration::RegistrationProtocol;
pub use session::{RegistrationStatus, SessionState};
pub use shutdown::{GracefulShutdown, ShutdownPhase, ShutdownSignal, ShutdownToken};
