use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use journalflow_accounting::{
    ExternalProcessInstance, JournalEntry, JournalStatus, ProcessEvent, WorkflowLogEntry,
};
use journalflow_core::{AggregateRoot, ExpectedVersion, JournalEntryId, ProcessInstanceId};

use super::r#trait::{JournalRepository, ProcessChange, RepositoryError, Transition};

#[derive(Debug, Default)]
struct State {
    entries: HashMap<JournalEntryId, JournalEntry>,
    logs: Vec<WorkflowLogEntry>,
    processes: HashMap<String, ExternalProcessInstance>,
    process_events: Vec<ProcessEvent>,
}

impl State {
    fn check_version(
        &self,
        id: JournalEntryId,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let current = self
            .entries
            .get(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("journal entry {id}")))?;
        if expected.matches(current.version()) {
            Ok(())
        } else {
            Err(RepositoryError::Conflict(format!(
                "journal entry {id} was modified concurrently (expected {expected:?}, found {})",
                current.version()
            )))
        }
    }

    fn check_process_change(&self, change: &ProcessChange) -> Result<(), RepositoryError> {
        match change {
            ProcessChange::Start(p) => {
                if self.processes.contains_key(&p.external_instance_id) {
                    return Err(RepositoryError::Conflict(format!(
                        "process instance {} already exists",
                        p.external_instance_id
                    )));
                }
            }
            ProcessChange::Close(p) => self.check_running(p)?,
        }
        Ok(())
    }

    fn check_running(&self, p: &ExternalProcessInstance) -> Result<(), RepositoryError> {
        match self.processes.get(&p.external_instance_id) {
            Some(stored) if stored.is_running() => Ok(()),
            Some(stored) => Err(RepositoryError::Conflict(format!(
                "process instance {} already {}",
                stored.external_instance_id, stored.status
            ))),
            None => Err(RepositoryError::NotFound(format!(
                "process instance {}",
                p.external_instance_id
            ))),
        }
    }
}

/// In-memory journal repository.
///
/// Intended for tests/dev. Every write takes the single lock, so each
/// `commit_transition` is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJournalRepository {
    state: RwLock<State>,
}

impl InMemoryJournalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, RepositoryError> {
        self.state
            .read()
            .map_err(|_| RepositoryError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, RepositoryError> {
        self.state
            .write()
            .map_err(|_| RepositoryError::Backend("lock poisoned".to_string()))
    }
}

#[async_trait]
impl JournalRepository for InMemoryJournalRepository {
    async fn insert_entry(&self, entry: &JournalEntry) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let id = entry.id_typed();
        if state.entries.contains_key(&id) {
            return Err(RepositoryError::Conflict(format!("journal entry {id} already exists")));
        }
        state.entries.insert(id, entry.clone());
        Ok(())
    }

    async fn replace_entry(
        &self,
        entry: &JournalEntry,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        state.check_version(entry.id_typed(), expected_version)?;
        state.entries.insert(entry.id_typed(), entry.clone());
        Ok(())
    }

    async fn delete_entry(
        &self,
        id: JournalEntryId,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        state.check_version(id, expected_version)?;
        state.entries.remove(&id);
        Ok(())
    }

    async fn get_entry(&self, id: JournalEntryId) -> Result<Option<JournalEntry>, RepositoryError> {
        Ok(self.read()?.entries.get(&id).cloned())
    }

    async fn list_entries(
        &self,
        status: Option<JournalStatus>,
    ) -> Result<Vec<JournalEntry>, RepositoryError> {
        let state = self.read()?;
        let mut entries: Vec<JournalEntry> = state
            .entries
            .values()
            .filter(|e| status.is_none_or(|s| e.status() == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id_typed().cmp(&a.id_typed()))
        });
        Ok(entries)
    }

    async fn count_by_status(&self) -> Result<Vec<(JournalStatus, u64)>, RepositoryError> {
        let state = self.read()?;
        let mut counts: HashMap<JournalStatus, u64> = HashMap::new();
        for entry in state.entries.values() {
            *counts.entry(entry.status()).or_default() += 1;
        }
        Ok(JournalStatus::ALL
            .into_iter()
            .filter_map(|s| counts.get(&s).map(|c| (s, *c)))
            .collect())
    }

    async fn workflow_logs(
        &self,
        id: JournalEntryId,
    ) -> Result<Vec<WorkflowLogEntry>, RepositoryError> {
        Ok(self
            .read()?
            .logs
            .iter()
            .filter(|l| l.entry_id == id)
            .cloned()
            .collect())
    }

    async fn commit_transition(&self, transition: Transition) -> Result<(), RepositoryError> {
        let mut state = self.write()?;

        // Validate everything before mutating anything.
        let id = transition.entry.id_typed();
        state.check_version(id, transition.expected_version)?;
        if let Some(change) = &transition.process {
            state.check_process_change(change)?;
        }

        state.entries.insert(id, transition.entry);
        state.logs.extend(transition.logs);
        match transition.process {
            Some(ProcessChange::Start(p)) | Some(ProcessChange::Close(p)) => {
                state.processes.insert(p.external_instance_id.clone(), p);
            }
            None => {}
        }
        if let Some(event) = transition.process_event {
            state.process_events.push(event);
        }
        Ok(())
    }

    async fn find_process(
        &self,
        external_instance_id: &str,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError> {
        Ok(self.read()?.processes.get(external_instance_id).cloned())
    }

    async fn running_process_for(
        &self,
        entry_id: JournalEntryId,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError> {
        Ok(self
            .read()?
            .processes
            .values()
            .find(|p| p.source_entity_id == entry_id && p.is_running())
            .cloned())
    }

    async fn close_process(
        &self,
        instance: &ExternalProcessInstance,
        event: Option<ProcessEvent>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        state.check_running(instance)?;
        state
            .processes
            .insert(instance.external_instance_id.clone(), instance.clone());
        if let Some(event) = event {
            state.process_events.push(event);
        }
        Ok(())
    }

    async fn process_events(
        &self,
        instance_id: ProcessInstanceId,
    ) -> Result<Vec<ProcessEvent>, RepositoryError> {
        Ok(self
            .read()?
            .process_events
            .iter()
            .filter(|e| e.process_instance_id == instance_id)
            .cloned()
            .collect())
    }
}
