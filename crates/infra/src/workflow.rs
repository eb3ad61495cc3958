//! Journal entry workflow service.
//!
//! Every state change follows the same shape:
//!
//! 1. read the entry (and process instance, if any)
//! 2. call the external collaborator, if the transition needs one
//! 3. decide with the pure aggregate (`JournalEntry::handle`)
//! 4. commit entry, workflow log rows and process change in one
//!    `commit_transition`, guarded by the version read in step 1
//!
//! A transition that lost a race surfaces as `WorkflowError::Conflict`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use journalflow_accounting::{
    ApprovalDecision, ExternalProcessInstance, JournalCommand, JournalEntry, JournalEntryDraft,
    JournalStatus, ProcessEvent, ProcessEventType, TransitionMeta, WorkflowLogEntry,
    resolve_result,
};
use journalflow_core::{Aggregate, AggregateRoot, DomainError, ExpectedVersion, JournalEntryId};

use crate::external::{
    ApprovalEngine, ErpGateway, ErpJournalEntryPayload, ExternalErrorKind, ExternalServiceError,
    transform_to_payload,
};
use crate::repository::{JournalRepository, ProcessChange, RepositoryError, Transition};

/// Actor recorded for transitions driven by approval-engine callbacks.
pub const APPROVAL_ENGINE_ACTOR: &str = "approval-engine";
/// Actor recorded for the automatic post after approval.
pub const SYSTEM_ACTOR: &str = "system";
/// Prefix of instance ids made up locally when the engine could not be reached.
pub const SYNTHETIC_INSTANCE_PREFIX: &str = "mock-";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    External(#[from] ExternalServiceError),

    #[error("storage error: {0}")]
    Store(String),
}

impl From<DomainError> for WorkflowError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => WorkflowError::Validation(msg),
            DomainError::InvalidId(msg) => WorkflowError::Validation(msg),
            DomainError::NotFound(msg) => WorkflowError::NotFound(msg),
            DomainError::Conflict(msg) => WorkflowError::Conflict(msg),
        }
    }
}

impl From<RepositoryError> for WorkflowError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => WorkflowError::Conflict(msg),
            RepositoryError::NotFound(msg) => WorkflowError::NotFound(msg),
            RepositoryError::Backend(msg) => WorkflowError::Store(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub process_definition_id: String,
    /// Use a synthetic `mock-{millis}` instance id when the engine call fails.
    pub allow_mock_approval_fallback: bool,
    /// Upper bound on how long an approval callback waits for the automatic post.
    pub auto_post_timeout: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            process_definition_id: "mje.approval".to_string(),
            allow_mock_approval_fallback: false,
            auto_post_timeout: Duration::from_secs(30),
        }
    }
}

/// Body of an approval (or completion) callback.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalCallback {
    instance_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    context: Option<Value>,
}

/// Body of an error callback.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorCallback {
    instance_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

/// What happened to the automatic post after an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostingOutcome {
    NotAttempted,
    Posted(String),
    /// The post failed; the entry stays Approved for a manual retry.
    Failed(String),
    /// Still running in the background when the callback returned.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Instance closed and the entry moved to `status`.
    Applied {
        entry_id: JournalEntryId,
        status: JournalStatus,
        posting: PostingOutcome,
    },
    /// Instance closed; the entry was missing or no longer Pending.
    InstanceClosed,
    /// Instance was already closed by an earlier delivery; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub status: JournalStatus,
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total: u64,
    pub draft: u64,
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatusView {
    pub instance: ExternalProcessInstance,
    /// Instance document as reported by the engine.
    pub engine: Value,
}

/// Journal entry workflow: CRUD on drafts, state transitions, and the
/// approval-engine callbacks.
///
/// Cloning is cheap; clones share the repository, collaborators and the
/// in-flight posting set.
#[derive(Clone)]
pub struct JournalWorkflow {
    repo: Arc<dyn JournalRepository>,
    approval: Arc<dyn ApprovalEngine>,
    erp: Arc<dyn ErpGateway>,
    settings: WorkflowSettings,
    posting: Arc<Mutex<HashSet<JournalEntryId>>>,
}

/// Marks an entry as being posted; released on drop.
struct PostingClaim {
    in_flight: Arc<Mutex<HashSet<JournalEntryId>>>,
    id: JournalEntryId,
}

impl Drop for PostingClaim {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.id);
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn not_found(id: JournalEntryId) -> WorkflowError {
    WorkflowError::NotFound(format!("Journal entry not found: {id}"))
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl JournalWorkflow {
    pub fn new(
        repo: Arc<dyn JournalRepository>,
        approval: Arc<dyn ApprovalEngine>,
        erp: Arc<dyn ErpGateway>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            repo,
            approval,
            erp,
            settings,
            posting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    // Drafts

    #[instrument(skip(self, draft), err)]
    pub async fn create_entry(&self, draft: JournalEntryDraft) -> Result<JournalEntry, WorkflowError> {
        let entry = JournalEntry::create(JournalEntryId::new(), draft, now())?;
        self.repo.insert_entry(&entry).await?;
        info!(entry_id = %entry.id_typed(), "journal entry created");
        Ok(entry)
    }

    #[instrument(skip(self, draft), err)]
    pub async fn update_entry(
        &self,
        id: JournalEntryId,
        draft: JournalEntryDraft,
    ) -> Result<JournalEntry, WorkflowError> {
        let mut entry = self.load(id).await?;
        let expected = ExpectedVersion::Exact(entry.version());
        entry.revise(draft, now())?;
        self.repo.replace_entry(&entry, expected).await?;
        Ok(entry)
    }

    #[instrument(skip(self), err)]
    pub async fn delete_entry(&self, id: JournalEntryId) -> Result<(), WorkflowError> {
        let entry = self.load(id).await?;
        entry.ensure_deletable()?;
        self.repo
            .delete_entry(id, ExpectedVersion::Exact(entry.version()))
            .await?;
        info!(entry_id = %id, "journal entry deleted");
        Ok(())
    }

    // Reads

    pub async fn get_entry(&self, id: JournalEntryId) -> Result<JournalEntry, WorkflowError> {
        self.load(id).await
    }

    pub async fn list_entries(
        &self,
        status: Option<JournalStatus>,
    ) -> Result<Vec<JournalEntry>, WorkflowError> {
        Ok(self.repo.list_entries(status).await?)
    }

    pub async fn workflow_logs(&self, id: JournalEntryId) -> Result<Vec<WorkflowLogEntry>, WorkflowError> {
        self.load(id).await?;
        Ok(self.repo.workflow_logs(id).await?)
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, WorkflowError> {
        let mut stats = DashboardStats::default();
        for (status, count) in self.repo.count_by_status().await? {
            stats.total += count;
            match status {
                JournalStatus::Draft => stats.draft = count,
                JournalStatus::Pending => stats.pending = count,
                JournalStatus::Approved => stats.approved = count,
                JournalStatus::Rejected => stats.rejected = count,
            }
        }
        Ok(stats)
    }

    /// ERP wire payload for the entry, without posting it.
    pub async fn preview_payload(&self, id: JournalEntryId) -> Result<ErpJournalEntryPayload, WorkflowError> {
        let entry = self.load(id).await?;
        Ok(transform_to_payload(&entry))
    }

    // Transitions

    #[instrument(skip(self), err)]
    pub async fn submit(&self, id: JournalEntryId, actor: &str) -> Result<JournalStatus, WorkflowError> {
        let entry = self.load(id).await?;
        let next = self
            .commit(entry, &JournalCommand::Submit(TransitionMeta::new(actor, now())), None, None)
            .await?;
        Ok(next.status())
    }

    #[instrument(skip(self, comment), err)]
    pub async fn approve(
        &self,
        id: JournalEntryId,
        actor: &str,
        comment: Option<String>,
    ) -> Result<JournalStatus, WorkflowError> {
        let entry = self.load(id).await?;
        let command = JournalCommand::Approve {
            meta: TransitionMeta::new(actor, now()),
            comment,
        };
        Ok(self.commit(entry, &command, None, None).await?.status())
    }

    #[instrument(skip(self, comment), err)]
    pub async fn reject(
        &self,
        id: JournalEntryId,
        actor: &str,
        comment: Option<String>,
    ) -> Result<JournalStatus, WorkflowError> {
        let entry = self.load(id).await?;
        let command = JournalCommand::Reject {
            meta: TransitionMeta::new(actor, now()),
            comment,
        };
        Ok(self.commit(entry, &command, None, None).await?.status())
    }

    /// Start an approval workflow in the external engine and move the entry to Pending.
    #[instrument(skip(self), err)]
    pub async fn send_to_external_approval(
        &self,
        id: JournalEntryId,
        actor: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let entry = self.load(id).await?;
        entry.ensure_can_send_for_approval()?;
        if let Some(running) = self.repo.running_process_for(id).await? {
            return Err(WorkflowError::Conflict(format!(
                "An approval process is already running for entry {id}. Instance: {}",
                running.external_instance_id
            )));
        }

        let definition_id = self.settings.process_definition_id.as_str();
        let context = json!({
            "journalEntryId": id.to_string(),
            "companyCode": entry.company_code(),
            "postingDate": entry.posting_date(),
            "documentDate": entry.document_date(),
            "headerText": entry.header_text(),
            "currency": entry.currency(),
            "totalAmount": entry.total_amount(),
            "requestedBy": actor,
        });

        let instance_id = match self.approval.trigger_process(definition_id, context).await {
            Ok(instance_id) => instance_id,
            Err(err) if self.settings.allow_mock_approval_fallback => {
                let fallback = format!("{SYNTHETIC_INSTANCE_PREFIX}{}", now().timestamp_millis());
                warn!(error = %err, instance_id = %fallback, "approval engine unavailable; using synthetic instance");
                fallback
            }
            Err(err) => return Err(err.into()),
        };

        let at = now();
        let process = ExternalProcessInstance::start(instance_id.clone(), definition_id, id, at);
        let command = JournalCommand::SendForApproval {
            meta: TransitionMeta::new(actor, at),
            external_instance_id: instance_id.clone(),
        };

        match self
            .commit(entry, &command, Some(ProcessChange::Start(process)), None)
            .await
        {
            Ok(next) => Ok(ApprovalRequest {
                status: next.status(),
                instance_id,
            }),
            Err(err) => {
                // The engine already runs an instance nobody will track.
                if let Err(cancel_err) = self.approval.cancel(&instance_id).await {
                    warn!(instance_id = %instance_id, error = %cancel_err, "failed to cancel orphaned instance");
                }
                Err(err)
            }
        }
    }

    /// Post an Approved entry to the ERP gateway and record the document number.
    ///
    /// Fails with `Conflict` when the entry is already posted or another post
    /// for it is in flight; in both cases the gateway is not called.
    #[instrument(skip(self), err)]
    pub async fn post_to_erp(&self, id: JournalEntryId, actor: &str) -> Result<String, WorkflowError> {
        self.load(id).await?.ensure_can_post()?;
        let _claim = self.claim_posting(id)?;

        // Re-read under the claim: a concurrent post may have just finished.
        let entry = self.load(id).await?;
        entry.ensure_can_post()?;

        let document_number = self.erp.post_entry(&entry).await?;
        let command = JournalCommand::RecordPosting {
            meta: TransitionMeta::new(actor, now()),
            document_number: document_number.clone(),
        };
        if let Err(err) = self.commit(entry, &command, None, None).await {
            error!(
                entry_id = %id,
                document_number = %document_number,
                error = %err,
                "entry posted in ERP but recording the document number failed"
            );
            return Err(err);
        }
        Ok(document_number)
    }

    // Callbacks

    /// Approval decision from the engine. Closes the instance, applies the
    /// decision to a Pending entry and, on approval, posts it.
    #[instrument(skip(self, payload), err)]
    pub async fn on_approval_callback(&self, payload: Value) -> Result<CallbackOutcome, WorkflowError> {
        let callback: ApprovalCallback = parse_callback(&payload)?;
        let instance_id = required_instance_id(callback.instance_id.as_deref())?;
        let Some(instance) = self.find_process(instance_id).await? else {
            return Err(process_not_found(instance_id));
        };
        if !instance.is_running() {
            info!(instance_id, status = %instance.status, "duplicate approval callback ignored");
            return Ok(CallbackOutcome::Duplicate);
        }

        let result = resolve_result(callback.decision.as_deref(), callback.status.as_deref());
        let decision = ApprovalDecision::from_result(&result);
        let context = callback.context.unwrap_or(Value::Null);
        let comment = non_empty_str(context.get("comment"));
        let context_document_number = non_empty_str(context.get("accountingDocumentNumber"));

        let at = now();
        let mut closed = instance.clone();
        closed.complete(Some(result.clone()), at)?;
        let event = ProcessEvent::new(instance.id, ProcessEventType::Approval, payload, at);

        let entry_id = instance.source_entity_id;
        let entry = self.repo.get_entry(entry_id).await?;

        let Some(entry) = entry.filter(|e| e.status() == JournalStatus::Pending) else {
            warn!(instance_id, entry_id = %entry_id, "entry missing or not Pending; closing instance only");
            if !self.close_instance(&closed, event).await? {
                return Ok(CallbackOutcome::Duplicate);
            }
            if decision == ApprovalDecision::Approved {
                if let Some(number) = context_document_number {
                    self.record_context_posting(entry_id, number).await;
                }
            }
            return Ok(CallbackOutcome::InstanceClosed);
        };

        let meta = TransitionMeta::new(APPROVAL_ENGINE_ACTOR, at);
        let command = match decision {
            ApprovalDecision::Approved => JournalCommand::Approve { meta, comment },
            ApprovalDecision::Rejected => JournalCommand::Reject { meta, comment },
        };

        let next = match self
            .commit(entry, &command, Some(ProcessChange::Close(closed)), Some(event))
            .await
        {
            Ok(next) => next,
            Err(WorkflowError::Conflict(msg)) => {
                if self.is_closed(instance_id).await? {
                    info!(instance_id, "concurrent duplicate approval callback ignored");
                    return Ok(CallbackOutcome::Duplicate);
                }
                return Err(WorkflowError::Conflict(msg));
            }
            Err(err) => return Err(err),
        };
        info!(instance_id, entry_id = %entry_id, result = %result, status = %next.status(), "approval applied");

        let posting = match decision {
            ApprovalDecision::Rejected => PostingOutcome::NotAttempted,
            ApprovalDecision::Approved => match context_document_number {
                Some(number) => self.record_context_posting(entry_id, number).await,
                None => self.auto_post(entry_id).await,
            },
        };

        Ok(CallbackOutcome::Applied {
            entry_id,
            status: next.status(),
            posting,
        })
    }

    /// Completion notice without a decision: closes the instance only.
    #[instrument(skip(self, payload), err)]
    pub async fn on_completion_callback(&self, payload: Value) -> Result<CallbackOutcome, WorkflowError> {
        let callback: ApprovalCallback = parse_callback(&payload)?;
        let instance_id = required_instance_id(callback.instance_id.as_deref())?;
        let Some(instance) = self.find_process(instance_id).await? else {
            return Err(process_not_found(instance_id));
        };
        if !instance.is_running() {
            return Ok(CallbackOutcome::Duplicate);
        }

        let at = now();
        let mut closed = instance.clone();
        closed.complete(None, at)?;
        let event = ProcessEvent::new(instance.id, ProcessEventType::Completed, payload, at);
        if !self.close_instance(&closed, event).await? {
            return Ok(CallbackOutcome::Duplicate);
        }
        info!(instance_id, "process instance completed");
        Ok(CallbackOutcome::InstanceClosed)
    }

    /// Engine-side failure: marks the instance Error. The entry is untouched.
    #[instrument(skip(self, payload), err)]
    pub async fn on_error_callback(&self, payload: Value) -> Result<CallbackOutcome, WorkflowError> {
        let callback: ErrorCallback = parse_callback(&payload)?;
        let instance_id = required_instance_id(callback.instance_id.as_deref())?;
        let Some(instance) = self.find_process(instance_id).await? else {
            return Err(process_not_found(instance_id));
        };
        if !instance.is_running() {
            return Ok(CallbackOutcome::Duplicate);
        }

        let message = callback
            .error_message
            .filter(|m| !m.trim().is_empty())
            .or(callback.error.filter(|m| !m.trim().is_empty()))
            .unwrap_or_else(|| "Unknown error".to_string());

        let at = now();
        let mut closed = instance.clone();
        closed.fail(message.clone(), at)?;
        let event = ProcessEvent::new(instance.id, ProcessEventType::Error, payload, at);
        if !self.close_instance(&closed, event).await? {
            return Ok(CallbackOutcome::Duplicate);
        }
        warn!(instance_id, error = %message, "process instance failed");
        Ok(CallbackOutcome::InstanceClosed)
    }

    // Process instances

    pub async fn process_status(&self, external_instance_id: &str) -> Result<ProcessStatusView, WorkflowError> {
        let Some(instance) = self.find_process(external_instance_id).await? else {
            return Err(process_not_found(external_instance_id));
        };
        let engine = self.approval.get_status(external_instance_id).await?;
        Ok(ProcessStatusView { instance, engine })
    }

    /// Cancel a running instance in the engine and mark it Error locally.
    /// The entry keeps its status and may be sent again.
    ///
    /// An instance the engine does not know (a synthetic fallback id, or a
    /// 404 from the engine) is closed locally only.
    #[instrument(skip(self), err)]
    pub async fn cancel_process(&self, external_instance_id: &str) -> Result<ExternalProcessInstance, WorkflowError> {
        let Some(instance) = self.find_process(external_instance_id).await? else {
            return Err(process_not_found(external_instance_id));
        };
        let mut closed = instance.clone();
        closed.fail("Cancelled", now())?;

        match self.approval.cancel(external_instance_id).await {
            Ok(()) => {}
            Err(err)
                if err.kind == ExternalErrorKind::NotFound
                    || external_instance_id.starts_with(SYNTHETIC_INSTANCE_PREFIX) =>
            {
                warn!(instance_id = external_instance_id, error = %err, "engine has no such instance; closing locally");
            }
            Err(err) => return Err(err.into()),
        }
        self.repo.close_process(&closed, None).await?;
        info!(instance_id = external_instance_id, "process instance cancelled");
        Ok(closed)
    }

    // Internals

    async fn load(&self, id: JournalEntryId) -> Result<JournalEntry, WorkflowError> {
        self.repo.get_entry(id).await?.ok_or_else(|| not_found(id))
    }

    async fn find_process(&self, external_instance_id: &str) -> Result<Option<ExternalProcessInstance>, WorkflowError> {
        Ok(self.repo.find_process(external_instance_id).await?)
    }

    async fn is_closed(&self, external_instance_id: &str) -> Result<bool, WorkflowError> {
        Ok(self
            .find_process(external_instance_id)
            .await?
            .is_some_and(|p| !p.is_running()))
    }

    /// Close without an entry transition. `false` when another delivery closed it first.
    async fn close_instance(&self, closed: &ExternalProcessInstance, event: ProcessEvent) -> Result<bool, WorkflowError> {
        match self.repo.close_process(closed, Some(event)).await {
            Ok(()) => Ok(true),
            Err(RepositoryError::Conflict(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Decide, apply and commit one command against `entry` as read.
    async fn commit(
        &self,
        entry: JournalEntry,
        command: &JournalCommand,
        process: Option<ProcessChange>,
        process_event: Option<ProcessEvent>,
    ) -> Result<JournalEntry, WorkflowError> {
        let events = entry.handle(command)?;
        let expected_version = ExpectedVersion::Exact(entry.version());

        let mut next = entry;
        for event in &events {
            next.apply(event);
        }

        self.repo
            .commit_transition(Transition {
                entry: next.clone(),
                expected_version,
                logs: events.iter().map(WorkflowLogEntry::from_event).collect(),
                process,
                process_event,
            })
            .await?;

        for event in &events {
            info!(
                event_type = event.event_type(),
                entry_id = %event.entry_id,
                actor = %event.actor,
                "journal entry transition"
            );
        }
        Ok(next)
    }

    fn claim_posting(&self, id: JournalEntryId) -> Result<PostingClaim, WorkflowError> {
        let mut in_flight = self
            .posting
            .lock()
            .map_err(|_| WorkflowError::Store("posting guard poisoned".to_string()))?;
        if !in_flight.insert(id) {
            return Err(WorkflowError::Conflict(format!(
                "A posting for entry {id} is already in progress"
            )));
        }
        Ok(PostingClaim {
            in_flight: Arc::clone(&self.posting),
            id,
        })
    }

    /// Best-effort post after approval. Runs as its own task so that a slow
    /// gateway keeps going after the callback stops waiting.
    async fn auto_post(&self, id: JournalEntryId) -> PostingOutcome {
        let this = self.clone();
        let task = tokio::spawn(async move { this.post_to_erp(id, SYSTEM_ACTOR).await });

        match tokio::time::timeout(self.settings.auto_post_timeout, task).await {
            Ok(Ok(Ok(number))) => {
                info!(entry_id = %id, document_number = %number, "automatic post succeeded");
                PostingOutcome::Posted(number)
            }
            Ok(Ok(Err(err))) => {
                warn!(entry_id = %id, error = %err, "automatic post failed; entry stays Approved for manual retry");
                PostingOutcome::Failed(err.to_string())
            }
            Ok(Err(join_err)) => {
                error!(entry_id = %id, error = %join_err, "automatic post task aborted");
                PostingOutcome::Failed(join_err.to_string())
            }
            Err(_) => {
                warn!(
                    entry_id = %id,
                    timeout_ms = self.settings.auto_post_timeout.as_millis() as u64,
                    "automatic post still running; not waiting any longer"
                );
                PostingOutcome::TimedOut
            }
        }
    }

    /// Record a document number the engine already obtained, without calling the gateway.
    async fn record_context_posting(&self, id: JournalEntryId, document_number: String) -> PostingOutcome {
        let recorded = async {
            let _claim = self.claim_posting(id)?;
            let entry = self.load(id).await?;
            let command = JournalCommand::RecordPosting {
                meta: TransitionMeta::new(APPROVAL_ENGINE_ACTOR, now()),
                document_number: document_number.clone(),
            };
            self.commit(entry, &command, None, None).await
        }
        .await;

        match recorded {
            Ok(_) => {
                info!(entry_id = %id, document_number = %document_number, "posting recorded from approval context");
                PostingOutcome::Posted(document_number)
            }
            Err(err) => {
                warn!(entry_id = %id, error = %err, "could not record posting from approval context");
                PostingOutcome::Failed(err.to_string())
            }
        }
    }
}

fn parse_callback<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, WorkflowError> {
    T::deserialize(payload).map_err(|e| WorkflowError::Validation(format!("invalid callback body: {e}")))
}

fn required_instance_id(instance_id: Option<&str>) -> Result<&str, WorkflowError> {
    instance_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WorkflowError::Validation("instanceId is required".to_string()))
}

fn process_not_found(external_instance_id: &str) -> WorkflowError {
    WorkflowError::NotFound(format!("Process instance not found: {external_instance_id}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use journalflow_accounting::{DcIndicator, LineItem, ProcessStatus, WorkflowAction};

    use super::*;
    use crate::external::{ExternalService, MockApprovalEngine, MockErpGateway};
    use crate::repository::InMemoryJournalRepository;

    fn line(dc: DcIndicator, amount: f64) -> LineItem {
        LineItem {
            gl_account: if dc == DcIndicator::Debit { "400000" } else { "113100" }.to_string(),
            amount,
            dc_indicator: dc,
            cost_center: None,
            profit_center: None,
            item_text: None,
        }
    }

    fn draft(items: Vec<LineItem>) -> JournalEntryDraft {
        JournalEntryDraft {
            company_code: "1000".into(),
            posting_date: NaiveDate::from_ymd_opt(2026, 9, 30).unwrap(),
            document_date: NaiveDate::from_ymd_opt(2026, 9, 30).unwrap(),
            header_text: "Month-end accrual".into(),
            currency: "EUR".into(),
            items,
        }
    }

    fn balanced() -> JournalEntryDraft {
        draft(vec![line(DcIndicator::Debit, 100.0), line(DcIndicator::Credit, 100.0)])
    }

    struct Harness {
        wf: JournalWorkflow,
        repo: Arc<InMemoryJournalRepository>,
        engine: Arc<MockApprovalEngine>,
    }

    fn harness_with(erp: Arc<dyn ErpGateway>, settings: WorkflowSettings) -> Harness {
        let repo = Arc::new(InMemoryJournalRepository::new());
        let engine = Arc::new(MockApprovalEngine::new(1));
        let wf = JournalWorkflow::new(repo.clone(), engine.clone(), erp, settings);
        Harness { wf, repo, engine }
    }

    fn harness(erp: Arc<MockErpGateway>) -> Harness {
        harness_with(erp, WorkflowSettings::default())
    }

    /// Fails the first `failures` posts, then succeeds.
    struct FlakyErp {
        failures: u64,
        calls: AtomicU64,
    }

    #[async_trait]
    impl ErpGateway for FlakyErp {
        async fn post_entry(&self, _entry: &JournalEntry) -> Result<String, ExternalServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ExternalServiceError::new(
                    ExternalService::ErpGateway,
                    ExternalErrorKind::Transient,
                    "HTTP 503 Service Unavailable",
                ))
            } else {
                Ok("5123456789".to_string())
            }
        }
    }

    struct SlowErp(Duration);

    #[async_trait]
    impl ErpGateway for SlowErp {
        async fn post_entry(&self, _entry: &JournalEntry) -> Result<String, ExternalServiceError> {
            tokio::time::sleep(self.0).await;
            Ok("5000000777".to_string())
        }
    }

    struct DownEngine;

    #[async_trait]
    impl ApprovalEngine for DownEngine {
        async fn trigger_process(&self, _: &str, _: Value) -> Result<String, ExternalServiceError> {
            Err(ExternalServiceError::new(
                ExternalService::ApprovalEngine,
                ExternalErrorKind::Authentication,
                "HTTP 401 Unauthorized",
            ))
        }

        async fn get_status(&self, _: &str) -> Result<Value, ExternalServiceError> {
            Ok(Value::Null)
        }

        async fn cancel(&self, _: &str) -> Result<(), ExternalServiceError> {
            Ok(())
        }
    }

    /// Engine whose cancel always fails with `cancel_kind`. Triggers fail
    /// too unless `instance_id` is set.
    struct FailingEngine {
        instance_id: Option<&'static str>,
        cancel_kind: ExternalErrorKind,
    }

    #[async_trait]
    impl ApprovalEngine for FailingEngine {
        async fn trigger_process(&self, _: &str, _: Value) -> Result<String, ExternalServiceError> {
            self.instance_id.map(str::to_string).ok_or_else(|| {
                ExternalServiceError::new(
                    ExternalService::ApprovalEngine,
                    ExternalErrorKind::Transient,
                    "HTTP 503 Service Unavailable",
                )
            })
        }

        async fn get_status(&self, _: &str) -> Result<Value, ExternalServiceError> {
            Ok(Value::Null)
        }

        async fn cancel(&self, _: &str) -> Result<(), ExternalServiceError> {
            Err(ExternalServiceError::new(
                ExternalService::ApprovalEngine,
                self.cancel_kind,
                "HTTP 404 Not Found",
            ))
        }
    }

    fn failing_workflow(engine: FailingEngine) -> JournalWorkflow {
        JournalWorkflow::new(
            Arc::new(InMemoryJournalRepository::new()),
            Arc::new(engine),
            Arc::new(MockErpGateway::default()),
            WorkflowSettings {
                allow_mock_approval_fallback: true,
                ..WorkflowSettings::default()
            },
        )
    }

    fn actions(logs: &[WorkflowLogEntry]) -> Vec<WorkflowAction> {
        logs.iter().map(|l| l.action).collect()
    }

    #[tokio::test]
    async fn balanced_entry_goes_from_draft_to_posted_once() {
        let erp = Arc::new(MockErpGateway::default());
        let h = harness(erp.clone());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();

        assert_eq!(h.wf.submit(id, "alice").await.unwrap(), JournalStatus::Pending);
        assert_eq!(h.wf.approve(id, "bob", None).await.unwrap(), JournalStatus::Approved);
        let number = h.wf.post_to_erp(id, "bob").await.unwrap();
        assert_eq!(number.len(), 10);
        assert!(number.starts_with('5'));

        let err = h.wf.post_to_erp(id, "bob").await.unwrap_err();
        match err {
            WorkflowError::Conflict(msg) => {
                assert_eq!(msg, format!("Entry already posted. Document Number: {number}"))
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(erp.calls(), 1);

        let entry = h.wf.get_entry(id).await.unwrap();
        assert_eq!(entry.status(), JournalStatus::Approved);
        assert_eq!(entry.accounting_document_number(), Some(number.as_str()));

        let logs = h.wf.workflow_logs(id).await.unwrap();
        assert_eq!(
            actions(&logs),
            vec![WorkflowAction::Submit, WorkflowAction::Approve, WorkflowAction::Post]
        );
        assert_eq!(logs[0].actor, "alice");
        assert_eq!(logs[1].comment.as_deref(), Some("Approved"));
        assert_eq!(
            logs[2].comment,
            Some(format!("Posted to ERP. Document Number: {number}"))
        );
        assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn unbalanced_submit_is_rejected_with_totals() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h
            .wf
            .create_entry(draft(vec![line(DcIndicator::Debit, 150.0), line(DcIndicator::Credit, 100.0)]))
            .await
            .unwrap()
            .id_typed();

        match h.wf.submit(id, "alice").await.unwrap_err() {
            WorkflowError::Validation(msg) => {
                assert_eq!(msg, "Cannot submit unbalanced entry. Debit: 150, Credit: 100")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(h.wf.get_entry(id).await.unwrap().status(), JournalStatus::Draft);
        assert!(h.wf.workflow_logs(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn post_requires_approval() {
        let erp = Arc::new(MockErpGateway::default());
        let h = harness(erp.clone());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();

        match h.wf.post_to_erp(id, "bob").await.unwrap_err() {
            WorkflowError::Validation(msg) => assert!(msg.starts_with("Only Approved entries can be posted")),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(erp.calls(), 0);
    }

    #[tokio::test]
    async fn approve_and_reject_require_pending() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();

        assert!(matches!(h.wf.approve(id, "bob", None).await, Err(WorkflowError::Validation(_))));

        h.wf.submit(id, "alice").await.unwrap();
        assert_eq!(
            h.wf.reject(id, "bob", Some("wrong cost center".into())).await.unwrap(),
            JournalStatus::Rejected
        );
        assert!(matches!(h.wf.approve(id, "bob", None).await, Err(WorkflowError::Validation(_))));

        let logs = h.wf.workflow_logs(id).await.unwrap();
        assert_eq!(logs.last().unwrap().comment.as_deref(), Some("wrong cost center"));
    }

    #[tokio::test]
    async fn concurrent_approve_and_reject_only_one_wins() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        h.wf.submit(id, "alice").await.unwrap();

        let (a, r) = tokio::join!(h.wf.approve(id, "bob", None), h.wf.reject(id, "carol", None));
        assert_eq!(a.is_ok() as u8 + r.is_ok() as u8, 1);
        assert_eq!(h.wf.workflow_logs(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_entry_is_not_found() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = JournalEntryId::new();
        assert!(matches!(h.wf.submit(id, "alice").await, Err(WorkflowError::NotFound(_))));
        assert!(matches!(h.wf.workflow_logs(id).await, Err(WorkflowError::NotFound(_))));
    }

    #[tokio::test]
    async fn drafts_can_be_edited_and_deleted_only_while_draft() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();

        let mut changed = balanced();
        changed.items = vec![line(DcIndicator::Debit, 250.0), line(DcIndicator::Credit, 250.0)];
        let updated = h.wf.update_entry(id, changed.clone()).await.unwrap();
        assert_eq!(updated.total_amount(), 250.0);

        h.wf.submit(id, "alice").await.unwrap();
        assert!(matches!(h.wf.update_entry(id, changed).await, Err(WorkflowError::Validation(_))));
        assert!(matches!(h.wf.delete_entry(id).await, Err(WorkflowError::Validation(_))));

        let other = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        h.wf.delete_entry(other).await.unwrap();
        assert!(matches!(h.wf.get_entry(other).await, Err(WorkflowError::NotFound(_))));
    }

    #[tokio::test]
    async fn stats_and_preview() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let a = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        h.wf.create_entry(balanced()).await.unwrap();
        h.wf.submit(a, "alice").await.unwrap();

        let stats = h.wf.dashboard_stats().await.unwrap();
        assert_eq!(
            stats,
            DashboardStats {
                total: 2,
                draft: 1,
                pending: 1,
                approved: 0,
                rejected: 0
            }
        );

        let payload = h.wf.preview_payload(a).await.unwrap();
        assert_eq!(payload.document_reference_id, a.to_string());
        assert_eq!(payload.items[0].debit_credit_code, "S");
        assert_eq!(payload.items[1].debit_credit_code, "H");
    }

    #[tokio::test]
    async fn webhook_approval_approves_and_posts_once() {
        let erp = Arc::new(MockErpGateway::default());
        let h = harness(erp.clone());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        h.wf.submit(id, "alice").await.unwrap();

        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();
        assert_eq!(sent.status, JournalStatus::Pending);
        assert_eq!(sent.instance_id, "mock-1");
        let (definition, context) = h.engine.triggered().remove(0);
        assert_eq!(definition, "mje.approval");
        assert_eq!(context["journalEntryId"], id.to_string());

        let payload = json!({"instanceId": "mock-1", "decision": "Approved"});
        let outcome = h.wf.on_approval_callback(payload.clone()).await.unwrap();
        let CallbackOutcome::Applied { status, posting, .. } = outcome else {
            panic!("expected applied outcome, got {outcome:?}");
        };
        assert_eq!(status, JournalStatus::Approved);
        let PostingOutcome::Posted(number) = posting else {
            panic!("expected automatic post, got {posting:?}");
        };

        let entry = h.wf.get_entry(id).await.unwrap();
        assert_eq!(entry.accounting_document_number(), Some(number.as_str()));

        let logs = h.wf.workflow_logs(id).await.unwrap();
        assert_eq!(
            actions(&logs),
            vec![
                WorkflowAction::Submit,
                WorkflowAction::SendToExternalApproval,
                WorkflowAction::Approve,
                WorkflowAction::Post
            ]
        );
        assert_eq!(logs[2].actor, APPROVAL_ENGINE_ACTOR);
        assert_eq!(logs[3].actor, SYSTEM_ACTOR);

        let instance = h.repo.find_process("mock-1").await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Completed);
        assert_eq!(instance.result.as_deref(), Some("Approved"));

        // Redelivery changes nothing and does not post again.
        assert_eq!(
            h.wf.on_approval_callback(payload).await.unwrap(),
            CallbackOutcome::Duplicate
        );
        assert_eq!(erp.calls(), 1);
        assert_eq!(h.wf.workflow_logs(id).await.unwrap().len(), 4);
        assert_eq!(h.repo.process_events(instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_approvals_post_once() {
        let erp = Arc::new(MockErpGateway::default());
        let h = harness(erp.clone());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let payload = json!({"instanceId": sent.instance_id, "decision": "Approved"});
        let (first, second) = tokio::join!(
            h.wf.on_approval_callback(payload.clone()),
            h.wf.on_approval_callback(payload.clone())
        );
        let outcomes = [first.unwrap(), second.unwrap()];

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, CallbackOutcome::Applied { posting: PostingOutcome::Posted(_), .. }))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| **o == CallbackOutcome::Duplicate)
            .count();
        assert_eq!((applied, duplicates), (1, 1));
        assert_eq!(erp.calls(), 1);
        assert_eq!(
            actions(&h.wf.workflow_logs(id).await.unwrap()),
            vec![
                WorkflowAction::SendToExternalApproval,
                WorkflowAction::Approve,
                WorkflowAction::Post
            ]
        );
    }

    #[tokio::test]
    async fn completed_status_without_decision_approves() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let outcome = h
            .wf
            .on_approval_callback(json!({"instanceId": sent.instance_id, "status": "COMPLETED"}))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Applied { status: JournalStatus::Approved, .. }
        ));
    }

    #[tokio::test]
    async fn other_results_reject_without_posting() {
        let erp = Arc::new(MockErpGateway::default());
        let h = harness(erp.clone());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let outcome = h
            .wf
            .on_approval_callback(json!({"instanceId": sent.instance_id, "status": "CANCELED"}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Applied {
                entry_id: id,
                status: JournalStatus::Rejected,
                posting: PostingOutcome::NotAttempted
            }
        );
        assert_eq!(erp.calls(), 0);
        let instance = h.repo.find_process(&sent.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.result.as_deref(), Some("CANCELED"));
    }

    #[tokio::test]
    async fn failed_auto_post_keeps_entry_approved_for_manual_retry() {
        let erp = Arc::new(FlakyErp {
            failures: 1,
            calls: AtomicU64::new(0),
        });
        let h = harness_with(erp.clone(), WorkflowSettings::default());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let outcome = h
            .wf
            .on_approval_callback(json!({"instanceId": sent.instance_id, "decision": "APPROVED"}))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Applied {
                status: JournalStatus::Approved,
                posting: PostingOutcome::Failed(_),
                ..
            }
        ));
        let entry = h.wf.get_entry(id).await.unwrap();
        assert_eq!(entry.status(), JournalStatus::Approved);
        assert!(!entry.is_posted());

        assert_eq!(h.wf.post_to_erp(id, "bob").await.unwrap(), "5123456789");
        assert_eq!(erp.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_auto_post_times_out_and_finishes_in_background() {
        let settings = WorkflowSettings {
            auto_post_timeout: Duration::from_millis(20),
            ..WorkflowSettings::default()
        };
        let h = harness_with(Arc::new(SlowErp(Duration::from_millis(200))), settings);
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let outcome = h
            .wf
            .on_approval_callback(json!({"instanceId": sent.instance_id, "decision": "Approved"}))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Applied {
                posting: PostingOutcome::TimedOut,
                ..
            }
        ));
        assert!(!h.wf.get_entry(id).await.unwrap().is_posted());

        // A manual post while the background one is in flight is refused.
        assert!(matches!(h.wf.post_to_erp(id, "bob").await, Err(WorkflowError::Conflict(_))));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let entry = h.wf.get_entry(id).await.unwrap();
        assert_eq!(entry.accounting_document_number(), Some("5000000777"));
    }

    #[tokio::test]
    async fn document_number_in_callback_context_is_recorded_without_gateway_call() {
        let erp = Arc::new(MockErpGateway::default());
        let h = harness(erp.clone());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let outcome = h
            .wf
            .on_approval_callback(json!({
                "instanceId": sent.instance_id,
                "decision": "Approved",
                "context": {"accountingDocumentNumber": "5999999999", "comment": "ok by controller"}
            }))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Applied { posting: PostingOutcome::Posted(ref n), .. } if n == "5999999999"
        ));
        assert_eq!(erp.calls(), 0);

        let logs = h.wf.workflow_logs(id).await.unwrap();
        let approve = &logs[logs.len() - 2];
        assert_eq!(approve.comment.as_deref(), Some("ok by controller"));
        let post = logs.last().unwrap();
        assert_eq!(post.action, WorkflowAction::Post);
        assert_eq!(post.actor, APPROVAL_ENGINE_ACTOR);
    }

    #[tokio::test]
    async fn callback_for_entry_no_longer_pending_only_closes_instance() {
        let erp = Arc::new(MockErpGateway::default());
        let h = harness(erp.clone());
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();
        h.wf.reject(id, "bob", None).await.unwrap();

        let outcome = h
            .wf
            .on_approval_callback(json!({"instanceId": sent.instance_id, "decision": "Approved"}))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::InstanceClosed);
        assert_eq!(h.wf.get_entry(id).await.unwrap().status(), JournalStatus::Rejected);
        assert_eq!(erp.calls(), 0);
        assert!(!h.repo.find_process(&sent.instance_id).await.unwrap().unwrap().is_running());
    }

    #[tokio::test]
    async fn unknown_instance_and_missing_id_are_reported() {
        let h = harness(Arc::new(MockErpGateway::default()));
        assert!(matches!(
            h.wf.on_approval_callback(json!({"instanceId": "nope", "decision": "Approved"})).await,
            Err(WorkflowError::NotFound(_))
        ));
        assert!(matches!(
            h.wf.on_error_callback(json!({"error": "boom"})).await,
            Err(WorkflowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn error_callback_marks_instance_failed_once() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let payload = json!({"instanceId": sent.instance_id, "error": "E42"});
        assert_eq!(
            h.wf.on_error_callback(payload.clone()).await.unwrap(),
            CallbackOutcome::InstanceClosed
        );
        assert_eq!(h.wf.on_error_callback(payload).await.unwrap(), CallbackOutcome::Duplicate);

        let instance = h.repo.find_process(&sent.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Error);
        assert_eq!(instance.error_message.as_deref(), Some("E42"));
        assert_eq!(h.repo.process_events(instance.id).await.unwrap().len(), 1);
        assert_eq!(h.wf.get_entry(id).await.unwrap().status(), JournalStatus::Pending);

        // With the instance closed the entry may be sent again.
        let again = h.wf.send_to_external_approval(id, "alice").await.unwrap();
        assert_eq!(again.instance_id, "mock-2");
    }

    #[tokio::test]
    async fn completion_callback_closes_without_decision() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        assert_eq!(
            h.wf.on_completion_callback(json!({"instanceId": sent.instance_id, "status": "COMPLETED"}))
                .await
                .unwrap(),
            CallbackOutcome::InstanceClosed
        );
        let instance = h.repo.find_process(&sent.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Completed);
        assert_eq!(instance.result, None);
        assert_eq!(h.wf.get_entry(id).await.unwrap().status(), JournalStatus::Pending);
    }

    #[tokio::test]
    async fn second_send_while_running_conflicts() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        h.wf.send_to_external_approval(id, "alice").await.unwrap();

        assert!(matches!(
            h.wf.send_to_external_approval(id, "alice").await,
            Err(WorkflowError::Conflict(_))
        ));
        assert_eq!(h.engine.triggered().len(), 1);
    }

    #[tokio::test]
    async fn unbalanced_entry_is_not_sent() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h
            .wf
            .create_entry(draft(vec![line(DcIndicator::Debit, 10.0), line(DcIndicator::Credit, 9.0)]))
            .await
            .unwrap()
            .id_typed();

        assert!(matches!(
            h.wf.send_to_external_approval(id, "alice").await,
            Err(WorkflowError::Validation(_))
        ));
        assert!(h.engine.triggered().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_falls_back_only_when_allowed() {
        let repo = Arc::new(InMemoryJournalRepository::new());
        let erp = Arc::new(MockErpGateway::default());

        let strict = JournalWorkflow::new(repo.clone(), Arc::new(DownEngine), erp.clone(), WorkflowSettings::default());
        let id = strict.create_entry(balanced()).await.unwrap().id_typed();
        match strict.send_to_external_approval(id, "alice").await.unwrap_err() {
            WorkflowError::External(err) => assert_eq!(err.kind, ExternalErrorKind::Authentication),
            other => panic!("expected external error, got {other:?}"),
        }
        assert_eq!(strict.get_entry(id).await.unwrap().status(), JournalStatus::Draft);

        let lenient = JournalWorkflow::new(
            repo,
            Arc::new(DownEngine),
            erp,
            WorkflowSettings {
                allow_mock_approval_fallback: true,
                ..WorkflowSettings::default()
            },
        );
        let sent = lenient.send_to_external_approval(id, "alice").await.unwrap();
        assert!(sent.instance_id.starts_with("mock-"));
        assert_eq!(sent.status, JournalStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_marks_instance_cancelled() {
        let h = harness(Arc::new(MockErpGateway::default()));
        let id = h.wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = h.wf.send_to_external_approval(id, "alice").await.unwrap();

        let view = h.wf.process_status(&sent.instance_id).await.unwrap();
        assert_eq!(view.engine["status"], "RUNNING");

        let cancelled = h.wf.cancel_process(&sent.instance_id).await.unwrap();
        assert_eq!(cancelled.status, ProcessStatus::Error);
        assert_eq!(cancelled.error_message.as_deref(), Some("Cancelled"));
        assert_eq!(h.engine.cancelled(), vec![sent.instance_id.clone()]);

        assert!(matches!(
            h.wf.cancel_process(&sent.instance_id).await,
            Err(WorkflowError::Conflict(_))
        ));
        assert!(matches!(h.wf.process_status("nope").await, Err(WorkflowError::NotFound(_))));
    }

    #[tokio::test]
    async fn synthetic_instance_can_be_cancelled_and_resent() {
        let wf = failing_workflow(FailingEngine {
            instance_id: None,
            cancel_kind: ExternalErrorKind::Transient,
        });
        let id = wf.create_entry(balanced()).await.unwrap().id_typed();
        let sent = wf.send_to_external_approval(id, "alice").await.unwrap();
        assert!(sent.instance_id.starts_with(SYNTHETIC_INSTANCE_PREFIX));
        assert!(matches!(
            wf.send_to_external_approval(id, "alice").await,
            Err(WorkflowError::Conflict(_))
        ));

        let cancelled = wf.cancel_process(&sent.instance_id).await.unwrap();
        assert_eq!(cancelled.status, ProcessStatus::Error);
        assert_eq!(cancelled.error_message.as_deref(), Some("Cancelled"));

        let again = wf.send_to_external_approval(id, "alice").await.unwrap();
        assert_eq!(again.status, JournalStatus::Pending);
    }

    #[tokio::test]
    async fn instance_unknown_to_engine_is_closed_locally() {
        let wf = failing_workflow(FailingEngine {
            instance_id: Some("wf-9"),
            cancel_kind: ExternalErrorKind::NotFound,
        });
        let id = wf.create_entry(balanced()).await.unwrap().id_typed();
        wf.send_to_external_approval(id, "alice").await.unwrap();

        let cancelled = wf.cancel_process("wf-9").await.unwrap();
        assert_eq!(cancelled.status, ProcessStatus::Error);
        assert!(wf.repo.running_process_for(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn engine_outage_keeps_real_instance_running() {
        let wf = failing_workflow(FailingEngine {
            instance_id: Some("wf-9"),
            cancel_kind: ExternalErrorKind::Transient,
        });
        let id = wf.create_entry(balanced()).await.unwrap().id_typed();
        wf.send_to_external_approval(id, "alice").await.unwrap();

        assert!(matches!(wf.cancel_process("wf-9").await, Err(WorkflowError::External(_))));
        assert!(wf.repo.running_process_for(id).await.unwrap().is_some());
    }
}
