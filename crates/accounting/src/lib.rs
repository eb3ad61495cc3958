//! Accounting module: manual journal entries and their approval workflow.
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod journal;
pub mod process;
pub mod workflow_log;

pub use journal::{
    BALANCE_EPSILON, DcIndicator, JournalChange, JournalCommand, JournalEntry, JournalEntryDraft,
    JournalEntryRecord, JournalEvent, JournalStatus, LineItem, Totals, TransitionMeta,
};
pub use process::{
    ApprovalDecision, ExternalProcessInstance, JOURNAL_ENTRY_SOURCE, ProcessEvent,
    ProcessEventType, ProcessStatus, resolve_result,
};
pub use workflow_log::{WorkflowAction, WorkflowLogEntry};
