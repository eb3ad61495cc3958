//! External approval process instances and the callbacks that close them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use journalflow_core::{DomainError, DomainResult, JournalEntryId, ProcessEventId, ProcessInstanceId};

/// Source entity type recorded on instances started for journal entries.
pub const JOURNAL_ENTRY_SOURCE: &str = "JournalEntry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessStatus {
    Running,
    Completed,
    Error,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Running => "Running",
            ProcessStatus::Completed => "Completed",
            ProcessStatus::Error => "Error",
        }
    }
}

impl core::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ProcessStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(ProcessStatus::Running),
            "Completed" => Ok(ProcessStatus::Completed),
            "Error" => Ok(ProcessStatus::Error),
            other => Err(DomainError::validation(format!("unknown process status '{other}'"))),
        }
    }
}

/// Local record of a workflow instance started in the approval engine.
///
/// `source_entity_id` is a weak reference: the entry may have been deleted
/// or moved on by the time the callback arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProcessInstance {
    pub id: ProcessInstanceId,
    pub external_instance_id: String,
    pub process_definition_id: String,
    pub source_entity_type: String,
    pub source_entity_id: JournalEntryId,
    pub status: ProcessStatus,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExternalProcessInstance {
    pub fn start(
        external_instance_id: impl Into<String>,
        process_definition_id: impl Into<String>,
        entry_id: JournalEntryId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProcessInstanceId::new(),
            external_instance_id: external_instance_id.into(),
            process_definition_id: process_definition_id.into(),
            source_entity_type: JOURNAL_ENTRY_SOURCE.to_string(),
            source_entity_id: entry_id,
            status: ProcessStatus::Running,
            result: None,
            error_message: None,
            started_at: now,
            completed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    /// Close the instance successfully. Fails with `Conflict` once closed, which
    /// callers treat as a duplicate delivery.
    pub fn complete(&mut self, result: Option<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running()?;
        self.status = ProcessStatus::Completed;
        self.result = result;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running()?;
        self.status = ProcessStatus::Error;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn ensure_running(&self) -> DomainResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "process instance {} already {}",
                self.external_instance_id, self.status
            )))
        }
    }
}

/// Outcome of an approval as applied to the journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    /// `Approved` / `APPROVED` approve; every other result rejects.
    pub fn from_result(result: &str) -> Self {
        match result {
            "Approved" | "APPROVED" => ApprovalDecision::Approved,
            _ => ApprovalDecision::Rejected,
        }
    }
}

/// Result string of an approval callback: the explicit decision when present,
/// otherwise `Approved` for a `COMPLETED` status, otherwise the raw status.
pub fn resolve_result(decision: Option<&str>, status: Option<&str>) -> String {
    if let Some(decision) = decision.filter(|d| !d.trim().is_empty()) {
        return decision.to_string();
    }
    match status {
        Some("COMPLETED") => "Approved".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessEventType {
    Approval,
    Completed,
    Error,
}

impl ProcessEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessEventType::Approval => "Approval",
            ProcessEventType::Completed => "Completed",
            ProcessEventType::Error => "Error",
        }
    }
}

impl core::str::FromStr for ProcessEventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Approval" => Ok(ProcessEventType::Approval),
            "Completed" => Ok(ProcessEventType::Completed),
            "Error" => Ok(ProcessEventType::Error),
            other => Err(DomainError::validation(format!("unknown process event type '{other}'"))),
        }
    }
}

/// Raw callback body as received from the approval engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEvent {
    pub id: ProcessEventId,
    pub process_instance_id: ProcessInstanceId,
    pub event_type: ProcessEventType,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl ProcessEvent {
    pub fn new(
        process_instance_id: ProcessInstanceId,
        event_type: ProcessEventType,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProcessEventId::new(),
            process_instance_id,
            event_type,
            payload,
            received_at,
        }
    }
}
