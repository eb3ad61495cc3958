use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use journalflow_accounting::{
    ExternalProcessInstance, JournalEntry, JournalStatus, ProcessEvent, WorkflowLogEntry,
};
use journalflow_core::{ExpectedVersion, JournalEntryId, ProcessInstanceId};

/// Repository operation error.
///
/// These are **infrastructure errors** (storage, lost races) as opposed to
/// domain errors (validation, wrong status).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Optimistic check failed: the row changed since it was read, or a
    /// process instance was already closed.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Backend(String),
}

/// Change to a process instance committed together with an entry transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessChange {
    /// Insert a new Running instance. Fails with `Conflict` on a duplicate external id.
    Start(ExternalProcessInstance),
    /// Overwrite a closed instance. Fails with `Conflict` unless the stored row is still Running.
    Close(ExternalProcessInstance),
}

/// Everything one workflow transition writes. Committed atomically: either all
/// of it is visible afterwards or none of it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Entry state after the transition's events were applied.
    pub entry: JournalEntry,
    /// Version the entry had when it was read.
    pub expected_version: ExpectedVersion,
    /// One row per applied event.
    pub logs: Vec<WorkflowLogEntry>,
    pub process: Option<ProcessChange>,
    pub process_event: Option<ProcessEvent>,
}

/// Relational store for the journal workflow.
///
/// Implementations must:
/// - compare the stored entry version with `expected_version` inside the same
///   atomic unit that writes the transition
/// - never update or delete workflow log rows
/// - only close process instances whose stored status is Running
#[async_trait]
pub trait JournalRepository: Send + Sync {
    async fn insert_entry(&self, entry: &JournalEntry) -> Result<(), RepositoryError>;

    /// Overwrite header and items of an entry (draft edits).
    async fn replace_entry(
        &self,
        entry: &JournalEntry,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError>;

    async fn delete_entry(
        &self,
        id: JournalEntryId,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError>;

    async fn get_entry(&self, id: JournalEntryId) -> Result<Option<JournalEntry>, RepositoryError>;

    /// Entries ordered by creation time, newest first.
    async fn list_entries(
        &self,
        status: Option<JournalStatus>,
    ) -> Result<Vec<JournalEntry>, RepositoryError>;

    /// Number of entries per status (statuses without entries are omitted).
    async fn count_by_status(&self) -> Result<Vec<(JournalStatus, u64)>, RepositoryError>;

    /// Workflow log of an entry in append order.
    async fn workflow_logs(&self, id: JournalEntryId)
    -> Result<Vec<WorkflowLogEntry>, RepositoryError>;

    async fn commit_transition(&self, transition: Transition) -> Result<(), RepositoryError>;

    async fn find_process(
        &self,
        external_instance_id: &str,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError>;

    async fn running_process_for(
        &self,
        entry_id: JournalEntryId,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError>;

    /// Close an instance without touching its entry, recording the callback.
    async fn close_process(
        &self,
        instance: &ExternalProcessInstance,
        event: Option<ProcessEvent>,
    ) -> Result<(), RepositoryError>;

    async fn process_events(
        &self,
        instance_id: ProcessInstanceId,
    ) -> Result<Vec<ProcessEvent>, RepositoryError>;
}

#[async_trait]
impl<R> JournalRepository for Arc<R>
where
    R: JournalRepository + ?Sized,
{
    async fn insert_entry(&self, entry: &JournalEntry) -> Result<(), RepositoryError> {
        (**self).insert_entry(entry).await
    }

    async fn replace_entry(
        &self,
        entry: &JournalEntry,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        (**self).replace_entry(entry, expected_version).await
    }

    async fn delete_entry(
        &self,
        id: JournalEntryId,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        (**self).delete_entry(id, expected_version).await
    }

    async fn get_entry(&self, id: JournalEntryId) -> Result<Option<JournalEntry>, RepositoryError> {
        (**self).get_entry(id).await
    }

    async fn list_entries(
        &self,
        status: Option<JournalStatus>,
    ) -> Result<Vec<JournalEntry>, RepositoryError> {
        (**self).list_entries(status).await
    }

    async fn count_by_status(&self) -> Result<Vec<(JournalStatus, u64)>, RepositoryError> {
        (**self).count_by_status().await
    }

    async fn workflow_logs(
        &self,
        id: JournalEntryId,
    ) -> Result<Vec<WorkflowLogEntry>, RepositoryError> {
        (**self).workflow_logs(id).await
    }

    async fn commit_transition(&self, transition: Transition) -> Result<(), RepositoryError> {
        (**self).commit_transition(transition).await
    }

    async fn find_process(
        &self,
        external_instance_id: &str,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError> {
        (**self).find_process(external_instance_id).await
    }

    async fn running_process_for(
        &self,
        entry_id: JournalEntryId,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError> {
        (**self).running_process_for(entry_id).await
    }

    async fn close_process(
        &self,
        instance: &ExternalProcessInstance,
        event: Option<ProcessEvent>,
    ) -> Result<(), RepositoryError> {
        (**self).close_process(instance, event).await
    }

    async fn process_events(
        &self,
        instance_id: ProcessInstanceId,
    ) -> Result<Vec<ProcessEvent>, RepositoryError> {
        (**self).process_events(instance_id).await
    }
}
