use serde::Serialize;
use sqlx::{Sqlite, SqliteConnection, Transaction as SqlxTransaction};
use tracing::{error, info, warn};

use crate::model::Snapshot;
use crate::reminders::ReminderScheduler;
use crate::store::{self, Store};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounts {
    pub partners: usize,
    pub transactions: usize,
}

/// Deep, order-preserving serialization of the full store
/// (transactions newest-first, partners in store order).
pub async fn export_snapshot(store: &Store) -> AppResult<Snapshot> {
    let transactions = store.list_transactions().await?;
    let partners = store.list_partners().await?;
    info!(
        target = "daftar",
        event = "snapshot_exported",
        transactions = transactions.len(),
        partners = partners.len()
    );
    Ok(Snapshot {
        transactions,
        partners,
    })
}

/// Cancel every reminder referenced by a stored transaction. Best-effort by
/// policy: a failed handle lookup is logged and the bulk operation
/// continues — the exclusive transaction that follows provides the real
/// consistency guarantee for rows.
async fn cancel_live_reminders(store: &Store, scheduler: &ReminderScheduler) {
    match store.live_reminder_ids().await {
        Ok(handles) => scheduler.cancel_all(handles),
        Err(e) => warn!(
            target = "daftar",
            event = "reminder_sweep_failed",
            error = %e
        ),
    }
}

async fn commit_or_rollback<R>(
    tx: SqlxTransaction<'_, Sqlite>,
    result: AppResult<R>,
    op: &str,
) -> AppResult<R> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(AppError::from)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                error!(target = "daftar", event = "bulk_rollback_failed", op = op, error = %rb);
            } else {
                info!(target = "daftar", event = "bulk_rolled_back", op = op);
            }
            Err(e)
        }
    }
}

async fn apply_import(
    conn: &mut SqliteConnection,
    snapshot: &Snapshot,
) -> AppResult<ImportCounts> {
    sqlx::query("DELETE FROM transactions")
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    sqlx::query("DELETE FROM partners")
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;

    let mut counts = ImportCounts {
        partners: 0,
        transactions: 0,
    };

    for partner in &snapshot.partners {
        // A partner without a name has no identity worth keeping; skip it
        // rather than sinking the whole import.
        if partner.name.trim().is_empty() {
            warn!(target = "daftar", event = "import_partner_skipped", reason = "blank_name");
            continue;
        }
        store::insert_partner(&mut *conn, partner).await?;
        counts.partners += 1;
    }

    for tx in &snapshot.transactions {
        if tx.id.trim().is_empty() {
            warn!(target = "daftar", event = "import_transaction_skipped", reason = "blank_id");
            continue;
        }
        store::insert_transaction(&mut *conn, tx).await?;
        counts.transactions += 1;
    }

    // Advance the autoincrement counter past the largest imported id so a
    // future auto-assigned partner can never collide with an imported one.
    let max_id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM partners")
        .fetch_one(&mut *conn)
        .await
        .map_err(AppError::from)?;
    if let Some(max_id) = max_id {
        sqlx::query("INSERT OR REPLACE INTO sqlite_sequence (name, seq) VALUES ('partners', ?)")
            .bind(max_id)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
    }

    Ok(counts)
}

/// Replace-all import: cancels live reminders, then deletes and reinserts
/// both tables inside one exclusive transaction. Any failure rolls back to
/// the pre-import state; a partial import is a correctness violation.
pub async fn import_snapshot(
    store: &Store,
    scheduler: &ReminderScheduler,
    snapshot: &Snapshot,
) -> AppResult<ImportCounts> {
    cancel_live_reminders(store, scheduler).await;

    let mut tx = store.pool().begin().await.map_err(AppError::from)?;
    let result = apply_import(&mut *tx, snapshot).await;
    let counts = commit_or_rollback(tx, result, "import").await?;

    info!(
        target = "daftar",
        event = "snapshot_imported",
        partners = counts.partners,
        transactions = counts.transactions
    );
    Ok(counts)
}

async fn apply_clear(conn: &mut SqliteConnection) -> AppResult<()> {
    sqlx::query("DELETE FROM transactions")
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    sqlx::query("DELETE FROM partners")
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    // Reset the autoincrement counter so a fresh ledger starts from 1.
    sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'partners'")
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Wipe both tables atomically. Shares the import contract: reminders are
/// cancelled first, and a failure leaves the store untouched.
pub async fn clear_all(store: &Store, scheduler: &ReminderScheduler) -> AppResult<()> {
    cancel_live_reminders(store, scheduler).await;

    let mut tx = store.pool().begin().await.map_err(AppError::from)?;
    let result = apply_clear(&mut *tx).await;
    commit_or_rollback(tx, result, "clear").await?;

    info!(target = "daftar", event = "store_cleared");
    Ok(())
}
