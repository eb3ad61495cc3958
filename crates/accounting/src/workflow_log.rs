use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use journalflow_core::{DomainError, JournalEntryId, WorkflowLogId};

use crate::journal::JournalEvent;

/// Audit action recorded for every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowAction {
    #[serde(rename = "Submit")]
    Submit,
    #[serde(rename = "Approve")]
    Approve,
    #[serde(rename = "Reject")]
    Reject,
    #[serde(rename = "Send to external approval")]
    SendToExternalApproval,
    #[serde(rename = "Post")]
    Post,
}

impl WorkflowAction {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowAction::Submit => "Submit",
            WorkflowAction::Approve => "Approve",
            WorkflowAction::Reject => "Reject",
            WorkflowAction::SendToExternalApproval => "Send to external approval",
            WorkflowAction::Post => "Post",
        }
    }
}

impl core::fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for WorkflowAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            WorkflowAction::Submit,
            WorkflowAction::Approve,
            WorkflowAction::Reject,
            WorkflowAction::SendToExternalApproval,
            WorkflowAction::Post,
        ]
        .into_iter()
        .find(|a| a.as_str() == s)
        .ok_or_else(|| DomainError::validation(format!("unknown workflow action '{s}'")))
    }
}

/// One append-only audit row. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowLogEntry {
    pub id: WorkflowLogId,
    pub entry_id: JournalEntryId,
    pub action: WorkflowAction,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub comment: Option<String>,
}

impl WorkflowLogEntry {
    pub fn from_event(event: &JournalEvent) -> Self {
        Self {
            id: WorkflowLogId::new(),
            entry_id: event.entry_id,
            action: event.action(),
            actor: event.actor.clone(),
            timestamp: event.occurred_at,
            comment: event.comment.clone(),
        }
    }
}
