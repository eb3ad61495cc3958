//! Postgres-backed journal repository.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | RepositoryError | Scenario |
//! |----------------------|-----------------|----------|
//! | `23505` (unique violation) | `Conflict` | duplicate entry id or external instance id |
//! | `40001` (serialization failure) | `Conflict` | concurrent transaction on the same rows |
//! | anything else | `Backend` | connectivity, schema, data errors |
//!
//! ## Atomicity
//!
//! `commit_transition` runs in one SERIALIZABLE transaction: the entry update is
//! guarded by `version = $expected`, the process change by `status = 'Running'`,
//! and the workflow log rows are inserted in the same transaction. Any zero-row
//! guard rolls the whole transaction back.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use journalflow_accounting::{
    DcIndicator, ExternalProcessInstance, JournalEntry, JournalEntryRecord, JournalStatus,
    LineItem, ProcessEvent, ProcessEventType, ProcessStatus, WorkflowAction, WorkflowLogEntry,
};
use journalflow_core::{
    AggregateRoot, ExpectedVersion, JournalEntryId, ProcessEventId, ProcessInstanceId,
    WorkflowLogId,
};

use super::r#trait::{JournalRepository, ProcessChange, RepositoryError, Transition};

const SCHEMA: &str = include_str!("../../migrations/0001_journal_workflow.sql");

/// Postgres-backed journal repository.
///
/// `PgPool` is internally reference counted; cloning the repository is cheap.
#[derive(Debug, Clone)]
pub struct PostgresJournalRepository {
    pool: PgPool,
}

impl PostgresJournalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let repo = Self::new(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    /// Apply the bundled schema (idempotent: every statement uses IF NOT EXISTS).
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;
        Ok(tx)
    }

    /// Read-only snapshot: a header and its items always come from the same state.
    async fn begin_read(&self) -> Result<Transaction<'static, Postgres>, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;
        Ok(tx)
    }
}

/// Line items of every entry in `ids`, in one query, keyed by entry id.
async fn load_items(
    tx: &mut Transaction<'static, Postgres>,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<LineItem>>, RepositoryError> {
    let mut items: HashMap<Uuid, Vec<LineItem>> = HashMap::new();
    if ids.is_empty() {
        return Ok(items);
    }

    let rows = sqlx::query(
        r#"
        SELECT entry_id, gl_account, amount, dc_indicator, cost_center, profit_center, item_text
        FROM journal_entry_items
        WHERE entry_id = ANY($1)
        ORDER BY entry_id, position ASC
        "#,
    )
    .bind(ids)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_items", e))?;

    for row in &rows {
        let entry_id: Uuid = get(row, "entry_id")?;
        items.entry(entry_id).or_default().push(item_from_row(row)?);
    }
    Ok(items)
}

/// Decode entry rows and attach their items, keeping row order.
async fn entries_with_items(
    tx: &mut Transaction<'static, Postgres>,
    rows: &[PgRow],
) -> Result<Vec<JournalEntry>, RepositoryError> {
    let ids = rows
        .iter()
        .map(|row| get::<Uuid>(row, "id"))
        .collect::<Result<Vec<_>, _>>()?;
    let mut items = load_items(tx, &ids).await?;

    rows.iter()
        .zip(&ids)
        .map(|(row, id)| entry_from_row(row, items.remove(id).unwrap_or_default()))
        .collect()
}

#[async_trait]
impl JournalRepository for PostgresJournalRepository {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id_typed()), err)]
    async fn insert_entry(&self, entry: &JournalEntry) -> Result<(), RepositoryError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO journal_entries (
                id, company_code, posting_date, document_date, header_text, currency,
                total_amount, status, accounting_document_number, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id_typed().as_uuid())
        .bind(entry.company_code())
        .bind(entry.posting_date())
        .bind(entry.document_date())
        .bind(entry.header_text())
        .bind(entry.currency())
        .bind(entry.total_amount())
        .bind(entry.status().as_str())
        .bind(entry.accounting_document_number())
        .bind(entry.created_at())
        .bind(entry.updated_at())
        .bind(entry.version() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_entry", e))?;

        insert_items(&mut tx, entry).await?;
        commit(tx).await
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id_typed()), err)]
    async fn replace_entry(
        &self,
        entry: &JournalEntry,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.begin().await?;
        update_entry_row(&mut tx, entry, expected_version).await?;

        sqlx::query("DELETE FROM journal_entry_items WHERE entry_id = $1")
            .bind(entry.id_typed().as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_items", e))?;
        insert_items(&mut tx, entry).await?;

        commit(tx).await
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn delete_entry(
        &self,
        id: JournalEntryId,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.begin().await?;
        let result = match expected_version {
            ExpectedVersion::Any => sqlx::query("DELETE FROM journal_entries WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await,
            ExpectedVersion::Exact(v) => {
                sqlx::query("DELETE FROM journal_entries WHERE id = $1 AND version = $2")
                    .bind(id.as_uuid())
                    .bind(v as i64)
                    .execute(&mut *tx)
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("delete_entry", e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(RepositoryError::Conflict(format!(
                "journal entry {id} was modified or removed concurrently"
            )));
        }
        commit(tx).await
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn get_entry(&self, id: JournalEntryId) -> Result<Option<JournalEntry>, RepositoryError> {
        let mut tx = self.begin_read().await?;
        let row = sqlx::query(&format!("{ENTRY_SELECT} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("get_entry", e))?;

        let entry = match row {
            Some(row) => entries_with_items(&mut tx, std::slice::from_ref(&row)).await?.pop(),
            None => None,
        };
        commit(tx).await?;
        Ok(entry)
    }

    #[instrument(skip(self), err)]
    async fn list_entries(
        &self,
        status: Option<JournalStatus>,
    ) -> Result<Vec<JournalEntry>, RepositoryError> {
        let mut tx = self.begin_read().await?;
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "{ENTRY_SELECT} WHERE status = $1 ORDER BY created_at DESC, id DESC"
                ))
                .bind(s.as_str())
                .fetch_all(&mut *tx)
                .await
            }
            None => {
                sqlx::query(&format!("{ENTRY_SELECT} ORDER BY created_at DESC, id DESC"))
                    .fetch_all(&mut *tx)
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("list_entries", e))?;

        let entries = entries_with_items(&mut tx, &rows).await?;
        commit(tx).await?;
        Ok(entries)
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self) -> Result<Vec<(JournalStatus, u64)>, RepositoryError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM journal_entries GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("decode_count", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("decode_count", e))?;
            counts.push((parse_status(&status)?, count as u64));
        }
        counts.sort_by_key(|(s, _)| JournalStatus::ALL.iter().position(|x| x == s));
        Ok(counts)
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn workflow_logs(
        &self,
        id: JournalEntryId,
    ) -> Result<Vec<WorkflowLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, entry_id, action, actor, timestamp, comment
            FROM workflow_logs
            WHERE entry_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("workflow_logs", e))?;

        rows.iter().map(log_from_row).collect()
    }

    #[instrument(
        skip(self, transition),
        fields(
            entry_id = %transition.entry.id_typed(),
            expected_version = ?transition.expected_version,
            log_count = transition.logs.len()
        ),
        err
    )]
    async fn commit_transition(&self, transition: Transition) -> Result<(), RepositoryError> {
        let mut tx = self.begin().await?;

        update_entry_row(&mut tx, &transition.entry, transition.expected_version).await?;

        for log in &transition.logs {
            sqlx::query(
                r#"
                INSERT INTO workflow_logs (id, entry_id, action, actor, timestamp, comment)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(log.id.as_uuid())
            .bind(log.entry_id.as_uuid())
            .bind(log.action.as_str())
            .bind(&log.actor)
            .bind(log.timestamp)
            .bind(&log.comment)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_log", e))?;
        }

        match &transition.process {
            Some(ProcessChange::Start(p)) => insert_process(&mut tx, p).await?,
            Some(ProcessChange::Close(p)) => close_process_row(&mut tx, p).await?,
            None => {}
        }

        if let Some(event) = &transition.process_event {
            insert_process_event(&mut tx, event).await?;
        }

        commit(tx).await
    }

    #[instrument(skip(self), err)]
    async fn find_process(
        &self,
        external_instance_id: &str,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError> {
        let row = sqlx::query(&format!("{PROCESS_SELECT} WHERE external_instance_id = $1"))
            .bind(external_instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_process", e))?;
        row.as_ref().map(process_from_row).transpose()
    }

    #[instrument(skip(self), fields(entry_id = %entry_id), err)]
    async fn running_process_for(
        &self,
        entry_id: JournalEntryId,
    ) -> Result<Option<ExternalProcessInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{PROCESS_SELECT} WHERE source_entity_id = $1 AND status = 'Running' ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(entry_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("running_process_for", e))?;
        row.as_ref().map(process_from_row).transpose()
    }

    #[instrument(skip(self, instance, event), fields(instance = %instance.external_instance_id), err)]
    async fn close_process(
        &self,
        instance: &ExternalProcessInstance,
        event: Option<ProcessEvent>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.begin().await?;
        close_process_row(&mut tx, instance).await?;
        if let Some(event) = &event {
            insert_process_event(&mut tx, event).await?;
        }
        commit(tx).await
    }

    #[instrument(skip(self), err)]
    async fn process_events(
        &self,
        instance_id: ProcessInstanceId,
    ) -> Result<Vec<ProcessEvent>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, process_instance_id, event_type, payload, received_at
            FROM process_events
            WHERE process_instance_id = $1
            ORDER BY received_at ASC
            "#,
        )
        .bind(instance_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("process_events", e))?;

        rows.iter()
            .map(|row| {
                let event_type: String = get(row, "event_type")?;
                Ok(ProcessEvent {
                    id: ProcessEventId::from_uuid(get(row, "id")?),
                    process_instance_id: ProcessInstanceId::from_uuid(get(row, "process_instance_id")?),
                    event_type: ProcessEventType::from_str(&event_type)
                        .map_err(|e| RepositoryError::Backend(e.to_string()))?,
                    payload: get(row, "payload")?,
                    received_at: get(row, "received_at")?,
                })
            })
            .collect()
    }
}

const ENTRY_SELECT: &str = r#"
    SELECT id, company_code, posting_date, document_date, header_text, currency,
           total_amount, status, accounting_document_number, created_at, updated_at, version
    FROM journal_entries"#;

const PROCESS_SELECT: &str = r#"
    SELECT id, external_instance_id, process_definition_id, source_entity_type, source_entity_id,
           status, result, error_message, started_at, completed_at
    FROM process_instances"#;

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), RepositoryError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn update_entry_row(
    tx: &mut Transaction<'static, Postgres>,
    entry: &JournalEntry,
    expected_version: ExpectedVersion,
) -> Result<(), RepositoryError> {
    let expected = match expected_version {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    };

    let result = sqlx::query(
        r#"
        UPDATE journal_entries
        SET company_code = $2,
            posting_date = $3,
            document_date = $4,
            header_text = $5,
            currency = $6,
            total_amount = $7,
            status = $8,
            accounting_document_number = COALESCE(accounting_document_number, $9),
            updated_at = $10,
            version = $11
        WHERE id = $1 AND ($12::BIGINT IS NULL OR version = $12)
        "#,
    )
    .bind(entry.id_typed().as_uuid())
    .bind(entry.company_code())
    .bind(entry.posting_date())
    .bind(entry.document_date())
    .bind(entry.header_text())
    .bind(entry.currency())
    .bind(entry.total_amount())
    .bind(entry.status().as_str())
    .bind(entry.accounting_document_number())
    .bind(entry.updated_at())
    .bind(entry.version() as i64)
    .bind(expected)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_entry", e))?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict(format!(
            "journal entry {} was modified concurrently (expected {:?})",
            entry.id_typed(),
            expected_version
        )));
    }
    Ok(())
}

async fn insert_items(
    tx: &mut Transaction<'static, Postgres>,
    entry: &JournalEntry,
) -> Result<(), RepositoryError> {
    for (position, item) in entry.items().iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO journal_entry_items (
                entry_id, position, gl_account, amount, dc_indicator,
                cost_center, profit_center, item_text
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id_typed().as_uuid())
        .bind(position as i32)
        .bind(&item.gl_account)
        .bind(item.amount)
        .bind(item.dc_indicator.code())
        .bind(&item.cost_center)
        .bind(&item.profit_center)
        .bind(&item.item_text)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_item", e))?;
    }
    Ok(())
}

async fn insert_process(
    tx: &mut Transaction<'static, Postgres>,
    p: &ExternalProcessInstance,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO process_instances (
            id, external_instance_id, process_definition_id, source_entity_type, source_entity_id,
            status, result, error_message, started_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(p.id.as_uuid())
    .bind(&p.external_instance_id)
    .bind(&p.process_definition_id)
    .bind(&p.source_entity_type)
    .bind(p.source_entity_id.as_uuid())
    .bind(p.status.as_str())
    .bind(&p.result)
    .bind(&p.error_message)
    .bind(p.started_at)
    .bind(p.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_process", e))?;
    Ok(())
}

async fn close_process_row(
    tx: &mut Transaction<'static, Postgres>,
    p: &ExternalProcessInstance,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        r#"
        UPDATE process_instances
        SET status = $2, result = $3, error_message = $4, completed_at = $5
        WHERE external_instance_id = $1 AND status = 'Running'
        "#,
    )
    .bind(&p.external_instance_id)
    .bind(p.status.as_str())
    .bind(&p.result)
    .bind(&p.error_message)
    .bind(p.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("close_process", e))?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict(format!(
            "process instance {} is no longer running",
            p.external_instance_id
        )));
    }
    Ok(())
}

async fn insert_process_event(
    tx: &mut Transaction<'static, Postgres>,
    event: &ProcessEvent,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO process_events (id, process_instance_id, event_type, payload, received_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.id.as_uuid())
    .bind(event.process_instance_id.as_uuid())
    .bind(event.event_type.as_str())
    .bind(&event.payload)
    .bind(event.received_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_process_event", e))?;
    Ok(())
}

// Row decoding

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| RepositoryError::Backend(format!("failed to decode column {column}: {e}")))
}

fn parse_status(s: &str) -> Result<JournalStatus, RepositoryError> {
    JournalStatus::from_str(s).map_err(|e| RepositoryError::Backend(e.to_string()))
}

fn entry_from_row(row: &PgRow, items: Vec<LineItem>) -> Result<JournalEntry, RepositoryError> {
    let status: String = get(row, "status")?;
    let version: i64 = get(row, "version")?;
    Ok(JournalEntry::rehydrate(JournalEntryRecord {
        id: JournalEntryId::from_uuid(get(row, "id")?),
        company_code: get(row, "company_code")?,
        posting_date: get::<NaiveDate>(row, "posting_date")?,
        document_date: get::<NaiveDate>(row, "document_date")?,
        header_text: get(row, "header_text")?,
        currency: get(row, "currency")?,
        total_amount: get(row, "total_amount")?,
        status: parse_status(&status)?,
        accounting_document_number: get(row, "accounting_document_number")?,
        items,
        created_at: get::<DateTime<Utc>>(row, "created_at")?,
        updated_at: get::<DateTime<Utc>>(row, "updated_at")?,
        version: version as u64,
    }))
}

fn item_from_row(row: &PgRow) -> Result<LineItem, RepositoryError> {
    let dc: String = get(row, "dc_indicator")?;
    Ok(LineItem {
        gl_account: get(row, "gl_account")?,
        amount: get(row, "amount")?,
        dc_indicator: DcIndicator::from_code(&dc).map_err(|e| RepositoryError::Backend(e.to_string()))?,
        cost_center: get(row, "cost_center")?,
        profit_center: get(row, "profit_center")?,
        item_text: get(row, "item_text")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<WorkflowLogEntry, RepositoryError> {
    let action: String = get(row, "action")?;
    Ok(WorkflowLogEntry {
        id: WorkflowLogId::from_uuid(get(row, "id")?),
        entry_id: JournalEntryId::from_uuid(get(row, "entry_id")?),
        action: WorkflowAction::from_str(&action).map_err(|e| RepositoryError::Backend(e.to_string()))?,
        actor: get(row, "actor")?,
        timestamp: get(row, "timestamp")?,
        comment: get(row, "comment")?,
    })
}

fn process_from_row(row: &PgRow) -> Result<ExternalProcessInstance, RepositoryError> {
    let status: String = get(row, "status")?;
    Ok(ExternalProcessInstance {
        id: ProcessInstanceId::from_uuid(get(row, "id")?),
        external_instance_id: get(row, "external_instance_id")?,
        process_definition_id: get(row, "process_definition_id")?,
        source_entity_type: get(row, "source_entity_type")?,
        source_entity_id: JournalEntryId::from_uuid(get(row, "source_entity_id")?),
        status: ProcessStatus::from_str(&status).map_err(|e| RepositoryError::Backend(e.to_string()))?,
        result: get(row, "result")?,
        error_message: get(row, "error_message")?,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => RepositoryError::Conflict(msg),
                _ => RepositoryError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Backend(format!("connection pool closed during {operation}"))
        }
        other => RepositoryError::Backend(format!("{operation} failed: {other}")),
    }
}
