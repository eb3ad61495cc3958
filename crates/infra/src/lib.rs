//! Infrastructure layer: persistence, outbound HTTP clients, configuration,
//! and the workflow service that ties them to the accounting domain.

pub mod config;
pub mod external;
pub mod repository;
pub mod workflow;

pub use config::{AppConfig, ConfigError, Environment};
pub use repository::{InMemoryJournalRepository, JournalRepository, PostgresJournalRepository};
pub use workflow::{
    ApprovalRequest, CallbackOutcome, DashboardStats, JournalWorkflow, PostingOutcome,
    ProcessStatusView, WorkflowError, WorkflowSettings,
};
