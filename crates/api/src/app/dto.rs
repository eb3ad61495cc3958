use serde::Deserialize;
use serde_json::{Value, json};

use journalflow_accounting::{JournalEntry, WorkflowLogEntry};

// -------------------------
// Request DTOs
// -------------------------

/// Body of approve / reject. Absent body and absent comment are equivalent.
#[derive(Debug, Default, Deserialize)]
pub struct CommentRequest {
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListEntriesQuery {
    pub status: Option<String>,
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn entry_to_json(entry: &JournalEntry) -> Value {
    json!({
        "id": entry.id_typed().to_string(),
        "companyCode": entry.company_code(),
        "postingDate": entry.posting_date(),
        "documentDate": entry.document_date(),
        "headerText": entry.header_text(),
        "currency": entry.currency(),
        "totalAmount": entry.total_amount(),
        "status": entry.status(),
        "accountingDocumentNumber": entry.accounting_document_number(),
        "items": entry.items(),
        "createdAt": entry.created_at(),
        "updatedAt": entry.updated_at(),
    })
}

pub fn entry_summary_to_json(entry: &JournalEntry) -> Value {
    json!({
        "id": entry.id_typed().to_string(),
        "companyCode": entry.company_code(),
        "postingDate": entry.posting_date(),
        "headerText": entry.header_text(),
        "currency": entry.currency(),
        "totalAmount": entry.total_amount(),
        "status": entry.status(),
        "accountingDocumentNumber": entry.accounting_document_number(),
        "createdAt": entry.created_at(),
    })
}

pub fn log_to_json(log: &WorkflowLogEntry) -> Value {
    json!({
        "id": log.id.to_string(),
        "action": log.action.as_str(),
        "actor": log.actor,
        "timestamp": log.timestamp,
        "comment": log.comment,
    })
}
