use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use sqlx::SqlitePool;

use daftar_lib::migrate;
use daftar_lib::model::{Partner, Snapshot, Transaction};
use daftar_lib::reminders::{LogNotifier, ReminderScheduler};
use daftar_lib::snapshot::{clear_all, export_snapshot, import_snapshot};
use daftar_lib::store::Store;
use daftar_lib::time::now_ms;

async fn setup() -> Result<(Store, ReminderScheduler)> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    migrate::apply_migrations(&pool).await?;
    Ok((Store::new(pool), ReminderScheduler::new(Arc::new(LogNotifier))))
}

fn snapshot_fixture() -> Snapshot {
    Snapshot::parse(&json!({
        "transactions": [
            { "id": "t1", "type": "sale", "item": "bread", "amount": 7.5, "date": "2026-03-01" },
            { "id": "t2", "type": "purchase", "item": "flour", "amount": 20.0, "date": "2026-02-15" }
        ],
        "partners": [
            { "id": 4, "name": "Sara", "percent": 40.0 },
            { "name": "Karim", "percent": 60.0 }
        ]
    }))
}

#[tokio::test]
async fn import_replaces_everything_and_reports_counts() -> Result<()> {
    let (store, scheduler) = setup().await?;

    let stale: Transaction = serde_json::from_value(json!({ "id": "old", "item": "gone" }))?;
    store.upsert_transaction(&stale).await?;

    let counts = import_snapshot(&store, &scheduler, &snapshot_fixture()).await?;
    assert_eq!(counts.transactions, 2);
    assert_eq!(counts.partners, 2);

    let rows = store.list_transactions().await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|t| t.id != "old"));
    Ok(())
}

#[tokio::test]
async fn import_preserves_explicit_ids_and_advances_the_sequence() -> Result<()> {
    let (store, scheduler) = setup().await?;
    import_snapshot(&store, &scheduler, &snapshot_fixture()).await?;

    let partners = store.list_partners().await?;
    assert_eq!(partners.len(), 2);
    assert!(partners.iter().any(|p| p.id == Some(4) && p.name == "Sara"));

    // A partner added after the import must not collide with imported ids.
    let fresh: Partner = serde_json::from_value(json!({ "name": "Nadia" }))?;
    let id = store.upsert_partner(&fresh).await?;
    assert!(id > 4, "expected id past the imported maximum, got {id}");
    Ok(())
}

#[tokio::test]
async fn import_skips_blank_records_without_failing() -> Result<()> {
    let (store, scheduler) = setup().await?;

    let snapshot = Snapshot::parse(&json!({
        "transactions": [ { "id": "t1" }, { "id": "  " }, { "item": "no id" } ],
        "partners": [ { "name": "Sara" }, { "name": "" } ]
    }));
    let counts = import_snapshot(&store, &scheduler, &snapshot).await?;
    assert_eq!(counts.transactions, 1);
    assert_eq!(counts.partners, 1);
    Ok(())
}

#[tokio::test]
async fn failed_import_rolls_back_to_the_previous_state() -> Result<()> {
    let (store, scheduler) = setup().await?;

    let keep: Transaction = serde_json::from_value(json!({ "id": "keep", "item": "bread" }))?;
    store.upsert_transaction(&keep).await?;

    // Break the partners table so the import fails mid-transaction.
    sqlx::query("ALTER TABLE partners RENAME TO partners_hidden")
        .execute(store.pool())
        .await?;

    let err = import_snapshot(&store, &scheduler, &snapshot_fixture())
        .await
        .unwrap_err();
    assert!(
        err.code().starts_with("Sqlite/") || err.code().starts_with("SQLX/"),
        "got {}",
        err.code()
    );

    // The delete of transactions ran inside the same transaction and must
    // have been rolled back with it.
    let rows = store.list_transactions().await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "keep");
    Ok(())
}

#[tokio::test]
async fn import_cancels_reminders_belonging_to_replaced_rows() -> Result<()> {
    let (store, scheduler) = setup().await?;

    let handle = scheduler.schedule(now_ms() + 3_600_000, "Debt due", "", Some("old"))?;
    let tx: Transaction =
        serde_json::from_value(json!({ "id": "old", "reminderId": handle }))?;
    store.upsert_transaction(&tx).await?;

    import_snapshot(&store, &scheduler, &snapshot_fixture()).await?;
    assert!(!scheduler.is_live(&handle));
    Ok(())
}

#[tokio::test]
async fn export_then_import_is_lossless() -> Result<()> {
    let (store, scheduler) = setup().await?;
    import_snapshot(&store, &scheduler, &snapshot_fixture()).await?;

    let exported = export_snapshot(&store).await?;
    assert_eq!(exported.transactions.len(), 2);
    assert_eq!(exported.partners.len(), 2);

    // Round-trip through the serialized form, as a backup file would.
    let serialized = serde_json::to_value(&exported)?;
    let reparsed = Snapshot::parse(&serialized);
    import_snapshot(&store, &scheduler, &reparsed).await?;

    let again = export_snapshot(&store).await?;
    assert_eq!(again, exported);
    Ok(())
}

#[tokio::test]
async fn clear_empties_both_tables_and_resets_partner_ids() -> Result<()> {
    let (store, scheduler) = setup().await?;
    import_snapshot(&store, &scheduler, &snapshot_fixture()).await?;

    clear_all(&store, &scheduler).await?;
    assert!(store.list_transactions().await?.is_empty());
    assert!(store.list_partners().await?.is_empty());

    // A fresh ledger numbers partners from 1 again.
    let p: Partner = serde_json::from_value(json!({ "name": "Sara" }))?;
    assert_eq!(store.upsert_partner(&p).await?, 1);
    Ok(())
}
