use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use journalflow_core::{Aggregate, AggregateRoot, DomainError, DomainResult, JournalEntryId};

use crate::workflow_log::WorkflowAction;

/// Tolerance applied when comparing debit and credit totals.
pub const BALANCE_EPSILON: f64 = 0.01;

/// Debit/credit indicator of a line item (`D` / `C` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DcIndicator {
    #[serde(rename = "D")]
    Debit,
    #[serde(rename = "C")]
    Credit,
}

impl DcIndicator {
    pub fn code(self) -> &'static str {
        match self {
            DcIndicator::Debit => "D",
            DcIndicator::Credit => "C",
        }
    }

    pub fn from_code(code: &str) -> DomainResult<Self> {
        match code {
            "D" => Ok(DcIndicator::Debit),
            "C" => Ok(DcIndicator::Credit),
            other => Err(DomainError::validation(format!(
                "invalid debit/credit indicator '{other}' (expected D or C)"
            ))),
        }
    }

    /// ERP ledger code: `S` (Soll) for debit, `H` (Haben) for credit.
    pub fn erp_code(self) -> &'static str {
        match self {
            DcIndicator::Debit => "S",
            DcIndicator::Credit => "H",
        }
    }
}

/// One line of a journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub gl_account: String,
    pub amount: f64,
    pub dc_indicator: DcIndicator,
    #[serde(default)]
    pub cost_center: Option<String>,
    #[serde(default)]
    pub profit_center: Option<String>,
    #[serde(default)]
    pub item_text: Option<String>,
}

/// Debit and credit sums of a set of line items.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Totals {
    pub debit: f64,
    pub credit: f64,
}

impl Totals {
    pub fn of(items: &[LineItem]) -> Self {
        items.iter().fold(Totals::default(), |mut acc, item| {
            match item.dc_indicator {
                DcIndicator::Debit => acc.debit += item.amount,
                DcIndicator::Credit => acc.credit += item.amount,
            }
            acc
        })
    }

    pub fn is_balanced(&self) -> bool {
        (self.debit - self.credit).abs() <= BALANCE_EPSILON
    }
}

/// Lifecycle status. "Posted" is not a status: it is an Approved entry that
/// carries an accounting document number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JournalStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
}

impl JournalStatus {
    pub const ALL: [JournalStatus; 4] = [
        JournalStatus::Draft,
        JournalStatus::Pending,
        JournalStatus::Approved,
        JournalStatus::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JournalStatus::Draft => "Draft",
            JournalStatus::Pending => "Pending",
            JournalStatus::Approved => "Approved",
            JournalStatus::Rejected => "Rejected",
        }
    }
}

impl core::fmt::Display for JournalStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JournalStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JournalStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown journal status '{s}'")))
    }
}

/// Editable content of a journal entry (header + items).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntryDraft {
    pub company_code: String,
    pub posting_date: NaiveDate,
    pub document_date: NaiveDate,
    #[serde(default)]
    pub header_text: String,
    pub currency: String,
    pub items: Vec<LineItem>,
}

impl JournalEntryDraft {
    /// Shape validation applied on save. Balance is checked on submit, not here.
    pub fn validate(&self) -> DomainResult<()> {
        if self.company_code.trim().is_empty() {
            return Err(DomainError::validation("company code is required"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(
                "currency must be a 3-letter ISO code",
            ));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation("journal entry must have line items"));
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.gl_account.trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "line {}: GL account is required",
                    idx + 1
                )));
            }
            if !item.amount.is_finite() || item.amount <= 0.0 {
                return Err(DomainError::validation(format!(
                    "line {}: amount must be positive",
                    idx + 1
                )));
            }
        }
        Ok(())
    }
}

/// Flat persisted form of a journal entry, used by repositories to rehydrate.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntryRecord {
    pub id: JournalEntryId,
    pub company_code: String,
    pub posting_date: NaiveDate,
    pub document_date: NaiveDate,
    pub header_text: String,
    pub currency: String,
    pub total_amount: f64,
    pub status: JournalStatus,
    pub accounting_document_number: Option<String>,
    pub items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Aggregate root: a manual journal entry.
///
/// Status and accounting document number change only through `apply`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    id: JournalEntryId,
    company_code: String,
    posting_date: NaiveDate,
    document_date: NaiveDate,
    header_text: String,
    currency: String,
    total_amount: f64,
    status: JournalStatus,
    accounting_document_number: Option<String>,
    items: Vec<LineItem>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl JournalEntry {
    /// Create a new entry in status Draft.
    pub fn create(id: JournalEntryId, draft: JournalEntryDraft, now: DateTime<Utc>) -> DomainResult<Self> {
        draft.validate()?;
        let total_amount = Totals::of(&draft.items).debit;
        Ok(Self {
            id,
            company_code: draft.company_code,
            posting_date: draft.posting_date,
            document_date: draft.document_date,
            header_text: draft.header_text,
            currency: draft.currency.to_ascii_uppercase(),
            total_amount,
            status: JournalStatus::Draft,
            accounting_document_number: None,
            items: draft.items,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    pub fn rehydrate(record: JournalEntryRecord) -> Self {
        Self {
            id: record.id,
            company_code: record.company_code,
            posting_date: record.posting_date,
            document_date: record.document_date,
            header_text: record.header_text,
            currency: record.currency,
            total_amount: record.total_amount,
            status: record.status,
            accounting_document_number: record.accounting_document_number,
            items: record.items,
            created_at: record.created_at,
            updated_at: record.updated_at,
            version: record.version,
        }
    }

    /// Replace header and items. Only drafts are editable.
    pub fn revise(&mut self, draft: JournalEntryDraft, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_status(&[JournalStatus::Draft], "Only Draft entries can be edited")?;
        draft.validate()?;
        self.total_amount = Totals::of(&draft.items).debit;
        self.company_code = draft.company_code;
        self.posting_date = draft.posting_date;
        self.document_date = draft.document_date;
        self.header_text = draft.header_text;
        self.currency = draft.currency.to_ascii_uppercase();
        self.items = draft.items;
        self.updated_at = now.max(self.updated_at);
        self.version += 1;
        Ok(())
    }

    pub fn ensure_deletable(&self) -> DomainResult<()> {
        self.ensure_status(&[JournalStatus::Draft], "Only Draft entries can be deleted")
    }

    pub fn id_typed(&self) -> JournalEntryId {
        self.id
    }

    pub fn company_code(&self) -> &str {
        &self.company_code
    }

    pub fn posting_date(&self) -> NaiveDate {
        self.posting_date
    }

    pub fn document_date(&self) -> NaiveDate {
        self.document_date
    }

    pub fn header_text(&self) -> &str {
        &self.header_text
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn total_amount(&self) -> f64 {
        self.total_amount
    }

    pub fn status(&self) -> JournalStatus {
        self.status
    }

    pub fn accounting_document_number(&self) -> Option<&str> {
        self.accounting_document_number.as_deref()
    }

    pub fn is_posted(&self) -> bool {
        self.accounting_document_number.is_some()
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn totals(&self) -> Totals {
        Totals::of(&self.items)
    }

    /// Precondition for routing the entry to the external approval engine.
    pub fn ensure_can_send_for_approval(&self) -> DomainResult<()> {
        self.ensure_status(
            &[JournalStatus::Draft, JournalStatus::Pending],
            "Only Draft or Pending entries can be sent to external approval",
        )?;
        self.ensure_balanced("Cannot send unbalanced entry to approval")
    }

    /// Precondition for posting to the ERP gateway.
    pub fn ensure_can_post(&self) -> DomainResult<()> {
        if let Some(number) = &self.accounting_document_number {
            return Err(DomainError::conflict(format!(
                "Entry already posted. Document Number: {number}"
            )));
        }
        self.ensure_status(&[JournalStatus::Approved], "Only Approved entries can be posted")
    }

    fn ensure_status(&self, allowed: &[JournalStatus], msg: &str) -> DomainResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "{msg} (current status: {})",
                self.status
            )))
        }
    }

    fn ensure_balanced(&self, prefix: &str) -> DomainResult<()> {
        let totals = self.totals();
        if totals.is_balanced() {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "{prefix}. Debit: {}, Credit: {}",
                totals.debit, totals.credit
            )))
        }
    }

    fn event(&self, meta: &TransitionMeta, comment: Option<String>, change: JournalChange) -> JournalEvent {
        JournalEvent {
            entry_id: self.id,
            actor: meta.actor.clone(),
            // Log timestamps never go backwards for an entry.
            occurred_at: meta.at.max(self.updated_at),
            comment,
            change,
        }
    }
}

impl AggregateRoot for JournalEntry {
    type Id = JournalEntryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Who performed a transition, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMeta {
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl TransitionMeta {
    pub fn new(actor: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            actor: actor.into(),
            at,
        }
    }
}

/// Every workflow action an entry accepts, matched in one place (`handle`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalCommand {
    Submit(TransitionMeta),
    SendForApproval {
        meta: TransitionMeta,
        external_instance_id: String,
    },
    Approve {
        meta: TransitionMeta,
        comment: Option<String>,
    },
    Reject {
        meta: TransitionMeta,
        comment: Option<String>,
    },
    RecordPosting {
        meta: TransitionMeta,
        document_number: String,
    },
}

/// What a transition changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalChange {
    Submitted,
    SentForApproval { external_instance_id: String },
    Approved,
    Rejected,
    Posted { document_number: String },
}

/// A recorded state transition. Each event becomes exactly one workflow log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEvent {
    pub entry_id: JournalEntryId,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    pub comment: Option<String>,
    pub change: JournalChange,
}

impl JournalEvent {
    pub fn event_type(&self) -> &'static str {
        match self.change {
            JournalChange::Submitted => "accounting.journal.submitted",
            JournalChange::SentForApproval { .. } => "accounting.journal.sent_for_approval",
            JournalChange::Approved => "accounting.journal.approved",
            JournalChange::Rejected => "accounting.journal.rejected",
            JournalChange::Posted { .. } => "accounting.journal.posted",
        }
    }

    pub fn action(&self) -> WorkflowAction {
        match self.change {
            JournalChange::Submitted => WorkflowAction::Submit,
            JournalChange::SentForApproval { .. } => WorkflowAction::SendToExternalApproval,
            JournalChange::Approved => WorkflowAction::Approve,
            JournalChange::Rejected => WorkflowAction::Reject,
            JournalChange::Posted { .. } => WorkflowAction::Post,
        }
    }
}

impl Aggregate for JournalEntry {
    type Command = JournalCommand;
    type Event = JournalEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match &event.change {
            JournalChange::Submitted | JournalChange::SentForApproval { .. } => {
                self.status = JournalStatus::Pending;
            }
            JournalChange::Approved => self.status = JournalStatus::Approved,
            JournalChange::Rejected => self.status = JournalStatus::Rejected,
            JournalChange::Posted { document_number } => {
                if self.accounting_document_number.is_none() {
                    self.accounting_document_number = Some(document_number.clone());
                }
            }
        }
        self.updated_at = event.occurred_at.max(self.updated_at);
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let event = match command {
            JournalCommand::Submit(meta) => {
                self.ensure_status(&[JournalStatus::Draft], "Only Draft entries can be submitted")?;
                self.ensure_balanced("Cannot submit unbalanced entry")?;
                self.event(
                    meta,
                    Some("Submitted for approval".to_string()),
                    JournalChange::Submitted,
                )
            }
            JournalCommand::SendForApproval {
                meta,
                external_instance_id,
            } => {
                self.ensure_can_send_for_approval()?;
                if external_instance_id.trim().is_empty() {
                    return Err(DomainError::validation("external instance id is required"));
                }
                self.event(
                    meta,
                    Some(format!("Sent to external approval. Instance: {external_instance_id}")),
                    JournalChange::SentForApproval {
                        external_instance_id: external_instance_id.clone(),
                    },
                )
            }
            JournalCommand::Approve { meta, comment } => {
                self.ensure_status(&[JournalStatus::Pending], "Only Pending entries can be approved")?;
                self.event(
                    meta,
                    Some(non_empty(comment).unwrap_or_else(|| "Approved".to_string())),
                    JournalChange::Approved,
                )
            }
            JournalCommand::Reject { meta, comment } => {
                self.ensure_status(&[JournalStatus::Pending], "Only Pending entries can be rejected")?;
                self.event(
                    meta,
                    Some(non_empty(comment).unwrap_or_else(|| "Rejected".to_string())),
                    JournalChange::Rejected,
                )
            }
            JournalCommand::RecordPosting {
                meta,
                document_number,
            } => {
                self.ensure_can_post()?;
                if document_number.trim().is_empty() {
                    return Err(DomainError::validation("document number is required"));
                }
                self.event(
                    meta,
                    Some(format!("Posted to ERP. Document Number: {document_number}")),
                    JournalChange::Posted {
                        document_number: document_number.clone(),
                    },
                )
            }
        };

        Ok(vec![event])
    }
}

fn non_empty(comment: &Option<String>) -> Option<String> {
    comment
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}
