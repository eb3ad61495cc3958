//! Persistence for journal entries, workflow logs and approval process instances.
//!
//! One trait, two implementations:
//! - `InMemoryJournalRepository` for tests/dev
//! - `PostgresJournalRepository` for production (sqlx)

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJournalRepository;
pub use postgres::PostgresJournalRepository;
pub use r#trait::{JournalRepository, ProcessChange, RepositoryError, Transition};
