use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use daftar_lib::ipc::{Dispatch, Dispatcher};
use daftar_lib::migrate;
use daftar_lib::reminders::LogNotifier;
use daftar_lib::security::{MemorySecretStore, NoBiometrics};
use daftar_lib::time::now_ms;
use daftar_lib::AppState;

async fn dispatcher() -> Result<Dispatcher> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    migrate::apply_migrations(&pool).await?;
    Ok(Dispatcher::new(AppState::new(
        pool,
        Arc::new(LogNotifier),
        Arc::new(MemorySecretStore::default()),
        Arc::new(NoBiometrics),
    )))
}

fn envelope(id: &str, kind: &str, payload: Value) -> String {
    json!({ "id": id, "type": kind, "payload": payload }).to_string()
}

/// Handle one envelope that must produce a reply, and return its parsed
/// `result`, asserting the id round-trips.
async fn reply(dispatcher: &Dispatcher, id: &str, kind: &str, payload: Value) -> Value {
    match dispatcher.handle(&envelope(id, kind, payload)).await {
        Dispatch::Reply(line) => {
            let parsed: Value = serde_json::from_str(&line).expect("response is JSON");
            assert_eq!(parsed["id"], id, "response must echo the request id");
            parsed["result"].clone()
        }
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[tokio::test]
async fn save_and_list_flow_through_envelopes() -> Result<()> {
    let d = dispatcher().await?;

    let result = reply(
        &d,
        "r1",
        "SAVE_TRANSACTION",
        json!({ "id": "t1", "type": "sale", "item": "bread", "amount": 7.5 }),
    )
    .await;
    assert_eq!(result["success"], true);

    let result = reply(&d, "r2", "GET_TRANSACTIONS", Value::Null).await;
    let rows = result.as_array().expect("list result is an array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "t1");
    assert_eq!(rows[0]["item"], "bread");

    let result = reply(&d, "r3", "DELETE_TRANSACTION", json!({ "id": "t1" })).await;
    assert_eq!(result["success"], true);

    let result = reply(&d, "r4", "GET_TRANSACTIONS", Value::Null).await;
    assert!(result.as_array().expect("array").is_empty());
    Ok(())
}

#[tokio::test]
async fn handler_failure_still_answers_the_envelope() -> Result<()> {
    let d = dispatcher().await?;

    let result = reply(&d, "r1", "SAVE_TRANSACTION", json!({ "id": "  " })).await;
    assert_eq!(result["success"], false);
    assert_eq!(result["code"], "VALIDATION/MISSING_ID");
    assert!(result["error"].as_str().is_some());
    Ok(())
}

#[tokio::test]
async fn unknown_type_with_id_gets_a_failure_reply() -> Result<()> {
    let d = dispatcher().await?;

    let result = reply(&d, "r1", "NOT_A_THING", Value::Null).await;
    assert_eq!(result["success"], false);
    assert_eq!(result["code"], "BRIDGE/UNKNOWN_TYPE");
    Ok(())
}

#[tokio::test]
async fn unanswerable_input_is_dropped_silently() -> Result<()> {
    let d = dispatcher().await?;

    // Not JSON at all.
    assert_eq!(d.handle("{nope").await, Dispatch::Silent);
    // Valid JSON, no id: nothing to correlate a reply to.
    assert_eq!(
        d.handle(&json!({ "type": "NOT_A_THING" }).to_string()).await,
        Dispatch::Silent
    );
    assert_eq!(
        d.handle(&json!({ "type": "GET_TRANSACTIONS" }).to_string())
            .await,
        Dispatch::Silent
    );
    Ok(())
}

#[tokio::test]
async fn fire_and_forget_signals_produce_no_reply() -> Result<()> {
    let d = dispatcher().await?;
    assert_eq!(
        d.handle(&envelope("r1", "EXIT_APP", Value::Null)).await,
        Dispatch::Exit
    );
    assert_eq!(
        d.handle(&envelope("r2", "GO_BACK", Value::Null)).await,
        Dispatch::Silent
    );
    Ok(())
}

#[tokio::test]
async fn reminder_scheduling_validates_the_timestamp() -> Result<()> {
    let d = dispatcher().await?;

    let result = reply(&d, "r1", "SCHEDULE_DEBT_REMINDER", json!({})).await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "Invalid timestamp");

    let soon = now_ms() + 2_000;
    let result = reply(
        &d,
        "r2",
        "SCHEDULE_DEBT_REMINDER",
        json!({ "timestamp": soon, "title": "Debt due" }),
    )
    .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "Reminder time must be in the future");
    Ok(())
}

#[tokio::test]
async fn reminder_schedule_and_cancel_round_trip() -> Result<()> {
    let d = dispatcher().await?;

    let result = reply(
        &d,
        "r1",
        "SCHEDULE_DEBT_REMINDER",
        json!({ "timestamp": now_ms() + 3_600_000, "title": "Debt due", "txId": "t1" }),
    )
    .await;
    assert_eq!(result["success"], true);
    let handle = result["reminderId"].as_str().expect("handle").to_string();
    assert!(d.state().scheduler.is_live(&handle));

    let result = reply(&d, "r2", "CANCEL_DEBT_REMINDER", json!({ "id": handle })).await;
    assert_eq!(result["success"], true);
    assert!(!d.state().scheduler.is_live(&handle));

    // Cancelling again (or with no id) still succeeds.
    let result = reply(&d, "r3", "CANCEL_DEBT_REMINDER", json!({})).await;
    assert_eq!(result["success"], true);
    Ok(())
}

#[tokio::test]
async fn security_flow_over_envelopes() -> Result<()> {
    let d = dispatcher().await?;

    let status = reply(&d, "r1", "SECURITY_GET", Value::Null).await;
    assert_eq!(status["pinEnabled"], false);
    assert_eq!(status["locked"], false);

    let result = reply(&d, "r2", "SECURITY_SET_PIN", json!({ "pin": "123" })).await;
    assert_eq!(result["success"], false);
    assert_eq!(result["code"], "AUTH/PIN_TOO_SHORT");

    let result = reply(&d, "r3", "SECURITY_SET_PIN", json!({ "pin": "1234" })).await;
    assert_eq!(result["success"], true);

    let status = reply(&d, "r4", "SECURITY_GET", Value::Null).await;
    assert_eq!(status["pinEnabled"], true);
    assert_eq!(status["locked"], true);

    let result = reply(&d, "r5", "SECURITY_UNLOCK_PIN", json!({ "pin": "9999" })).await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "Wrong PIN");

    let result = reply(&d, "r6", "SECURITY_UNLOCK_PIN", json!({ "pin": "1234" })).await;
    assert_eq!(result["success"], true);

    // Biometrics cannot be enabled without hardware.
    let result = reply(&d, "r7", "SECURITY_SET_BIOMETRIC", json!({ "enabled": true })).await;
    assert_eq!(result["success"], false);
    assert_eq!(result["code"], "AUTH/BIO_UNAVAILABLE");

    let result = reply(&d, "r8", "SECURITY_DISABLE_PIN", json!({ "pin": "1234" })).await;
    assert_eq!(result["success"], true);
    let status = reply(&d, "r9", "SECURITY_GET", Value::Null).await;
    assert_eq!(status["pinEnabled"], false);
    Ok(())
}

#[tokio::test]
async fn import_and_export_flow_through_envelopes() -> Result<()> {
    let d = dispatcher().await?;

    let result = reply(
        &d,
        "r1",
        "IMPORT_DATA",
        json!({ "state": {
            "transactions": [ { "id": "t1", "item": "bread" } ],
            "partners": [ { "name": "Sara" } ]
        }}),
    )
    .await;
    assert_eq!(result["success"], true);
    assert_eq!(result["counts"]["transactions"], 1);
    assert_eq!(result["counts"]["partners"], 1);

    let result = reply(&d, "r2", "EXPORT_DATA", Value::Null).await;
    assert_eq!(result["success"], true);
    assert_eq!(result["snapshot"]["transactions"][0]["id"], "t1");
    assert_eq!(result["snapshot"]["partners"][0]["name"], "Sara");

    let result = reply(&d, "r3", "CLEAR_ALL_DATA", Value::Null).await;
    assert_eq!(result["success"], true);
    let result = reply(&d, "r4", "EXPORT_DATA", Value::Null).await;
    assert!(result["snapshot"]["transactions"]
        .as_array()
        .expect("array")
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn responses_escape_unicode_line_separators() -> Result<()> {
    let d = dispatcher().await?;

    let result = reply(
        &d,
        "r1",
        "SAVE_TRANSACTION",
        json!({ "id": "t1", "item": "line\u{2028}break\u{2029}note" }),
    )
    .await;
    assert_eq!(result["success"], true);

    let Dispatch::Reply(line) = d.handle(&envelope("r2", "GET_TRANSACTIONS", Value::Null)).await
    else {
        panic!("expected a reply");
    };
    assert!(!line.contains('\u{2028}'));
    assert!(!line.contains('\u{2029}'));
    assert!(line.contains("\\u2028"));

    // The escaped form still decodes to the original text.
    let parsed: Value = serde_json::from_str(&line)?;
    let item = parsed["result"][0]["item"].as_str().expect("item");
    assert_eq!(item, "line\u{2028}break\u{2029}note");
    Ok(())
}
