use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{info, warn};

use crate::model::{parse_json_array, Partner, Transaction};
use crate::reminders::ReminderScheduler;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Persistent ledger store. Owns the sqlite pool; constructed explicitly by
/// the application context and passed by reference, never a global.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn json_text(items: &[Value]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn tx_from_row(row: &SqliteRow) -> Transaction {
    let installments_raw: String = row.try_get("installments").unwrap_or_default();
    Transaction {
        id: row.try_get("id").unwrap_or_default(),
        kind: row.try_get("type").unwrap_or_default(),
        item: row.try_get("item").unwrap_or_default(),
        quantity: row.try_get("quantity").unwrap_or(1.0),
        unit_price: row.try_get("unit_price").unwrap_or(0.0),
        amount: row.try_get("amount").unwrap_or(0.0),
        pricing_mode: row
            .try_get::<String, _>("pricing_mode")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unit".to_string()),
        date: row.try_get("date").unwrap_or_default(),
        is_credit: row.try_get::<i64, _>("is_credit").unwrap_or(0) != 0,
        client_name: row.try_get("client_name").unwrap_or_default(),
        paid_amount: row.try_get("paid_amount").unwrap_or(0.0),
        is_fully_paid: row.try_get::<i64, _>("is_fully_paid").unwrap_or(0) != 0,
        currency: row
            .try_get::<String, _>("currency")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "MAD".to_string()),
        created_at: row.try_get("created_at").unwrap_or(0),
        due_date: row.try_get("due_date").unwrap_or_default(),
        reminder_id: row
            .try_get::<Option<String>, _>("reminder_id")
            .ok()
            .flatten()
            .filter(|s| !s.is_empty()),
        is_installment_plan: row.try_get::<i64, _>("is_installment_plan").unwrap_or(0) != 0,
        installments: parse_json_array(&Value::String(installments_raw)),
        is_mock: row.try_get::<i64, _>("is_mock").unwrap_or(0) != 0,
    }
}

fn partner_from_row(row: &SqliteRow) -> Partner {
    let payouts_raw: String = row.try_get("payouts").unwrap_or_default();
    Partner {
        id: row.try_get::<i64, _>("id").ok(),
        name: row.try_get("name").unwrap_or_default(),
        percent: row.try_get("percent").unwrap_or(0.0),
        created_at: row.try_get("created_at").unwrap_or(0),
        invested_base: row.try_get("invested_base").unwrap_or(0.0),
        invested_at: row.try_get("invested_at").unwrap_or_default(),
        profit_schedule: row.try_get("profit_schedule").unwrap_or_default(),
        notes: row.try_get("notes").unwrap_or_default(),
        payouts: parse_json_array(&Value::String(payouts_raw)),
        is_mock: row.try_get::<i64, _>("is_mock").unwrap_or(0) != 0,
    }
}

/// Upsert one transaction row. Shared by the single-record path and the
/// bulk import transaction.
pub(crate) async fn insert_transaction<'e, E>(executor: E, tx: &Transaction) -> AppResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let created_at = if tx.created_at > 0 {
        tx.created_at
    } else {
        now_ms()
    };
    sqlx::query(
        "INSERT OR REPLACE INTO transactions \
         (id, type, item, amount, quantity, unit_price, pricing_mode, date, is_credit, \
          client_name, paid_amount, is_fully_paid, currency, created_at, due_date, reminder_id, \
          is_installment_plan, installments, is_mock) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&tx.id)
    .bind(&tx.kind)
    .bind(&tx.item)
    .bind(tx.amount)
    .bind(tx.quantity)
    .bind(tx.unit_price)
    .bind(&tx.pricing_mode)
    .bind(&tx.date)
    .bind(tx.is_credit as i64)
    .bind(&tx.client_name)
    .bind(tx.paid_amount)
    .bind(tx.is_fully_paid as i64)
    .bind(&tx.currency)
    .bind(created_at)
    .bind(&tx.due_date)
    .bind(tx.reminder_id.as_deref().filter(|s| !s.is_empty()))
    .bind(tx.is_installment_plan as i64)
    .bind(json_text(&tx.installments))
    .bind(tx.is_mock as i64)
    .execute(executor)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

/// Upsert one partner row. An explicit id is preserved (imports must keep
/// ids stable so later deletes match); without one the store assigns the
/// next autoincrement id. Returns the row id.
pub(crate) async fn insert_partner<'e, E>(executor: E, partner: &Partner) -> AppResult<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let created_at = if partner.created_at > 0 {
        partner.created_at
    } else {
        now_ms()
    };
    let payouts = json_text(&partner.payouts);
    let result = match partner.id {
        Some(id) => sqlx::query(
            "INSERT OR REPLACE INTO partners \
             (id, name, percent, created_at, invested_base, invested_at, profit_schedule, \
              notes, payouts, is_mock) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&partner.name)
        .bind(partner.percent)
        .bind(created_at)
        .bind(partner.invested_base)
        .bind(&partner.invested_at)
        .bind(&partner.profit_schedule)
        .bind(&partner.notes)
        .bind(payouts)
        .bind(partner.is_mock as i64)
        .execute(executor)
        .await
        .map_err(AppError::from)?,
        None => sqlx::query(
            "INSERT INTO partners \
             (name, percent, created_at, invested_base, invested_at, profit_schedule, \
              notes, payouts, is_mock) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&partner.name)
        .bind(partner.percent)
        .bind(created_at)
        .bind(partner.invested_base)
        .bind(&partner.invested_at)
        .bind(&partner.profit_schedule)
        .bind(&partner.notes)
        .bind(payouts)
        .bind(partner.is_mock as i64)
        .execute(executor)
        .await
        .map_err(AppError::from)?,
    };
    Ok(partner
        .id
        .unwrap_or_else(|| result.last_insert_rowid()))
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Store { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_transaction(&self, tx: &Transaction) -> AppResult<()> {
        if tx.id.trim().is_empty() {
            return Err(AppError::new(
                "VALIDATION/MISSING_ID",
                "Transaction id is required",
            ));
        }
        insert_transaction(&self.pool, tx).await?;
        info!(target = "daftar", event = "transaction_saved", id = %tx.id);
        Ok(())
    }

    /// All transactions, newest ledger date first.
    pub async fn list_transactions(&self) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions ORDER BY date DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(rows.iter().map(tx_from_row).collect())
    }

    /// Delete one transaction, cancelling its pending reminder first.
    ///
    /// Reminder cancellation is best-effort by policy: a failed lookup is
    /// logged and the delete proceeds, but a row must never be removed
    /// while its handle is still known to be live.
    pub async fn delete_transaction(
        &self,
        scheduler: &ReminderScheduler,
        id: &str,
    ) -> AppResult<()> {
        match self.reminder_id_of(id).await {
            Ok(Some(handle)) => scheduler.cancel(&handle),
            Ok(None) => {}
            Err(e) => warn!(
                target = "daftar",
                event = "reminder_lookup_failed",
                id = %id,
                error = %e
            ),
        }
        sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        info!(target = "daftar", event = "transaction_deleted", id = %id);
        Ok(())
    }

    pub async fn upsert_partner(&self, partner: &Partner) -> AppResult<i64> {
        if partner.name.trim().is_empty() {
            return Err(AppError::new(
                "VALIDATION/MISSING_NAME",
                "Partner name is required",
            ));
        }
        let id = insert_partner(&self.pool, partner).await?;
        info!(target = "daftar", event = "partner_saved", id = id);
        Ok(id)
    }

    /// All partners, id order.
    pub async fn list_partners(&self) -> AppResult<Vec<Partner>> {
        let rows = sqlx::query("SELECT * FROM partners ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(rows.iter().map(partner_from_row).collect())
    }

    pub async fn delete_partner(&self, id: i64) -> AppResult<()> {
        sqlx::query("DELETE FROM partners WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        info!(target = "daftar", event = "partner_deleted", id = id);
        Ok(())
    }

    /// The reminder handle of one row, if any. Absent row reads as `None`
    /// rather than an error — this is an optional read path.
    pub async fn reminder_id_of(&self, id: &str) -> AppResult<Option<String>> {
        let handle: Option<Option<String>> =
            sqlx::query_scalar("SELECT reminder_id FROM transactions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::from)?;
        Ok(handle.flatten().filter(|s| !s.is_empty()))
    }

    /// All live reminder handles currently referenced by transactions.
    pub async fn live_reminder_ids(&self) -> AppResult<Vec<String>> {
        let handles: Vec<String> = sqlx::query_scalar(
            "SELECT reminder_id FROM transactions \
             WHERE reminder_id IS NOT NULL AND reminder_id != ''",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(handles)
    }
}
