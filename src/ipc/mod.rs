use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::model::{Partner, Snapshot, Transaction};
use crate::snapshot;
use crate::state::AppState;
use crate::{AppError, AppResult};

pub mod bridge;

/// A decoded request envelope. Every recognized `type` maps to exactly one
/// variant; the set is closed and matched exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetTransactions,
    SaveTransaction(Box<Transaction>),
    DeleteTransaction { id: String },
    GetPartners,
    SavePartner(Box<Partner>),
    DeletePartner { id: i64 },
    ScheduleDebtReminder(SchedulePayload),
    CancelDebtReminder { id: Option<String> },
    ClearAllData,
    ImportData(Box<Snapshot>),
    ExportData,
    SecurityGet,
    SecuritySetPin { pin: String },
    SecurityUnlockPin { pin: String },
    SecurityDisablePin { pin: String },
    SecuritySetBiometric { enabled: bool },
    /// Fire-and-forget: navigation signal owned by the presentation layer.
    /// Accepted so a stray echo never produces an error reply.
    GoBack,
    /// Fire-and-forget: never answered, terminates the serve loop.
    ExitApp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePayload {
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tx_id: Option<String>,
}

fn bad_payload(e: serde_json::Error) -> AppError {
    AppError::new("VALIDATION/BAD_PAYLOAD", e.to_string())
}

fn payload_str(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        })
        .unwrap_or_default()
}

impl Request {
    /// Decode one `(type, payload)` pair. Unknown types are a
    /// `BRIDGE/UNKNOWN_TYPE` error so the caller can decide between
    /// answering generically (id present) and dropping (fire-and-forget).
    pub fn decode(kind: &str, payload: &Value) -> AppResult<Request> {
        Ok(match kind {
            "GET_TRANSACTIONS" => Request::GetTransactions,
            "SAVE_TRANSACTION" => Request::SaveTransaction(Box::new(
                serde_json::from_value(payload.clone()).map_err(bad_payload)?,
            )),
            "DELETE_TRANSACTION" => {
                let id = payload_str(payload, "id");
                if id.trim().is_empty() {
                    return Err(AppError::new(
                        "VALIDATION/MISSING_ID",
                        "Transaction id is required",
                    ));
                }
                Request::DeleteTransaction { id }
            }
            "GET_PARTNERS" => Request::GetPartners,
            "SAVE_PARTNER" => Request::SavePartner(Box::new(
                serde_json::from_value(payload.clone()).map_err(bad_payload)?,
            )),
            "DELETE_PARTNER" => {
                let id = payload_str(payload, "id");
                let id = id.trim().parse::<i64>().map_err(|_| {
                    AppError::new("VALIDATION/MISSING_ID", "Partner id is required")
                })?;
                Request::DeletePartner { id }
            }
            "SCHEDULE_DEBT_REMINDER" => Request::ScheduleDebtReminder(
                serde_json::from_value(payload.clone()).map_err(bad_payload)?,
            ),
            "CANCEL_DEBT_REMINDER" => {
                let id = payload_str(payload, "id");
                Request::CancelDebtReminder {
                    id: (!id.trim().is_empty()).then_some(id),
                }
            }
            "CLEAR_ALL_DATA" => Request::ClearAllData,
            "IMPORT_DATA" => {
                // Accept both shapes the presentation layer has used: a raw
                // JSON string under `content`, or a decoded object under
                // `state` (falling back to the payload itself).
                let incoming: Value = if let Some(content) =
                    payload.get("content").and_then(Value::as_str)
                {
                    serde_json::from_str(content)
                        .map_err(|e| AppError::from(e).with_context("field", "content"))?
                } else if let Some(state) = payload.get("state") {
                    state.clone()
                } else {
                    payload.clone()
                };
                Request::ImportData(Box::new(Snapshot::parse(&incoming)))
            }
            "EXPORT_DATA" => Request::ExportData,
            "SECURITY_GET" => Request::SecurityGet,
            "SECURITY_SET_PIN" => Request::SecuritySetPin {
                pin: payload_str(payload, "pin"),
            },
            "SECURITY_UNLOCK_PIN" => Request::SecurityUnlockPin {
                pin: payload_str(payload, "pin"),
            },
            "SECURITY_DISABLE_PIN" => Request::SecurityDisablePin {
                pin: payload_str(payload, "pin"),
            },
            "SECURITY_SET_BIOMETRIC" => Request::SecuritySetBiometric {
                enabled: payload
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "GO_BACK" => Request::GoBack,
            "EXIT_APP" => Request::ExitApp,
            other => {
                return Err(
                    AppError::new("BRIDGE/UNKNOWN_TYPE", "Unknown request type")
                        .with_context("type", other.to_string()),
                )
            }
        })
    }
}

/// Outcome of handling one raw envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A serialized `{id, result}` line to send back.
    Reply(String),
    /// Fire-and-forget or unanswerable input: nothing goes back.
    Silent,
    /// The peer asked the host to shut down.
    Exit,
}

/// Routes decoded requests to the store, scheduler, snapshot engine, and
/// security gate. Guarantees exactly one correlated response per envelope
/// that carries an id, handler failures included.
#[derive(Clone)]
pub struct Dispatcher {
    state: AppState,
}

/// Escape the Unicode line separators that break line-delimited transports
/// and injected-script encodings. serde_json leaves them raw (they are
/// valid JSON), so this runs on every outgoing line.
pub fn escape_line_separators(raw: &str) -> String {
    if !raw.contains(['\u{2028}', '\u{2029}']) {
        return raw.to_string();
    }
    raw.replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

fn envelope_id(value: &Value) -> Option<String> {
    match value.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

impl Dispatcher {
    pub fn new(state: AppState) -> Self {
        Dispatcher { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Handle one raw envelope line end to end.
    pub async fn handle(&self, raw: &str) -> Dispatch {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(target = "daftar", event = "envelope_parse_failed", error = %e);
                return Dispatch::Silent;
            }
        };
        let id = envelope_id(&value);
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);

        let request = match Request::decode(kind, &payload) {
            Ok(request) => request,
            Err(e) => {
                return match id {
                    // Still answer: an undecodable request must not leave
                    // the peer awaiting forever.
                    Some(id) => self.reply(&id, failure(&e)),
                    None => {
                        debug!(
                            target = "daftar",
                            event = "envelope_dropped",
                            kind = kind,
                            code = e.code()
                        );
                        Dispatch::Silent
                    }
                };
            }
        };

        match request {
            Request::ExitApp => return Dispatch::Exit,
            Request::GoBack => {
                debug!(target = "daftar", event = "nav_signal_ignored", kind = kind);
                return Dispatch::Silent;
            }
            _ => {}
        }

        let result = match self.dispatch(request).await {
            Ok(result) => result,
            Err(e) if e.is_not_found() => {
                // Optional read paths treat a missing resource as a normal
                // empty result, not a user-visible failure.
                debug!(target = "daftar", event = "not_found_downgraded", code = e.code());
                json!({ "success": true, "data": Value::Null })
            }
            Err(e) => {
                warn!(
                    target = "daftar",
                    event = "request_failed",
                    kind = kind,
                    code = e.code(),
                    error = %e
                );
                failure(&e)
            }
        };

        match id {
            Some(id) => self.reply(&id, result),
            None => Dispatch::Silent,
        }
    }

    fn reply(&self, id: &str, result: Value) -> Dispatch {
        let envelope = json!({ "id": id, "result": result });
        match serde_json::to_string(&envelope) {
            Ok(line) => Dispatch::Reply(escape_line_separators(&line)),
            Err(e) => {
                // Last-resort fallback keeps the exactly-once contract.
                warn!(target = "daftar", event = "response_encode_failed", error = %e);
                Dispatch::Reply(format!(
                    "{{\"id\":{},\"result\":{{\"success\":false,\"error\":\"encode failed\"}}}}",
                    json!(id)
                ))
            }
        }
    }

    async fn dispatch(&self, request: Request) -> AppResult<Value> {
        let state = &self.state;
        match request {
            Request::GetTransactions => {
                let rows = state.store.list_transactions().await?;
                Ok(serde_json::to_value(rows).map_err(AppError::from)?)
            }
            Request::SaveTransaction(tx) => {
                state.store.upsert_transaction(&tx).await?;
                Ok(json!({ "success": true }))
            }
            Request::DeleteTransaction { id } => {
                state
                    .store
                    .delete_transaction(&state.scheduler, &id)
                    .await?;
                Ok(json!({ "success": true }))
            }
            Request::GetPartners => {
                let rows = state.store.list_partners().await?;
                Ok(serde_json::to_value(rows).map_err(AppError::from)?)
            }
            Request::SavePartner(partner) => {
                state.store.upsert_partner(&partner).await?;
                Ok(json!({ "success": true }))
            }
            Request::DeletePartner { id } => {
                state.store.delete_partner(id).await?;
                Ok(json!({ "success": true }))
            }
            Request::ScheduleDebtReminder(payload) => {
                let timestamp = match payload.timestamp {
                    Some(ts) if ts.is_finite() && ts > 0.0 => ts as i64,
                    _ => {
                        return Err(AppError::new(
                            "SCHEDULE/INVALID_TIMESTAMP",
                            "Invalid timestamp",
                        ))
                    }
                };
                let handle = state.scheduler.schedule(
                    timestamp,
                    payload.title.as_deref().unwrap_or("Debt reminder"),
                    payload.body.as_deref().unwrap_or(""),
                    payload.tx_id.as_deref(),
                )?;
                Ok(json!({ "success": true, "reminderId": handle }))
            }
            Request::CancelDebtReminder { id } => {
                if let Some(id) = id {
                    state.scheduler.cancel(&id);
                }
                Ok(json!({ "success": true }))
            }
            Request::ClearAllData => {
                snapshot::clear_all(&state.store, &state.scheduler).await?;
                Ok(json!({ "success": true }))
            }
            Request::ImportData(incoming) => {
                let counts =
                    snapshot::import_snapshot(&state.store, &state.scheduler, &incoming).await?;
                Ok(json!({ "success": true, "counts": counts }))
            }
            Request::ExportData => {
                let snap = snapshot::export_snapshot(&state.store).await?;
                Ok(json!({ "success": true, "snapshot": snap }))
            }
            Request::SecurityGet => {
                let status = state.gate.refresh_status()?;
                Ok(serde_json::to_value(status).map_err(AppError::from)?)
            }
            Request::SecuritySetPin { pin } => {
                state.gate.set_pin(&pin)?;
                Ok(json!({ "success": true }))
            }
            Request::SecurityUnlockPin { pin } => {
                state.gate.unlock_with_pin(&pin)?;
                Ok(json!({ "success": true }))
            }
            Request::SecurityDisablePin { pin } => {
                state.gate.disable_pin(&pin)?;
                Ok(json!({ "success": true }))
            }
            Request::SecuritySetBiometric { enabled } => {
                state.gate.set_biometric(enabled)?;
                Ok(json!({ "success": true }))
            }
            Request::ExitApp | Request::GoBack => unreachable!("handled before dispatch"),
        }
    }
}

fn failure(error: &AppError) -> Value {
    json!({
        "success": false,
        "error": error.message(),
        "code": error.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_unicode_line_separators() {
        let raw = "{\"text\":\"a\u{2028}b\u{2029}c\"}";
        let escaped = escape_line_separators(raw);
        assert!(!escaped.contains('\u{2028}'));
        assert!(!escaped.contains('\u{2029}'));
        assert!(escaped.contains("\\u2028"));
        assert!(escaped.contains("\\u2029"));

        let untouched = "{\"text\":\"plain\"}";
        assert_eq!(escape_line_separators(untouched), untouched);
    }

    #[test]
    fn decodes_known_types_and_rejects_unknown() {
        let req = Request::decode("GET_TRANSACTIONS", &Value::Null).unwrap();
        assert_eq!(req, Request::GetTransactions);

        let req = Request::decode(
            "DELETE_TRANSACTION",
            &serde_json::json!({ "id": "t1" }),
        )
        .unwrap();
        assert_eq!(req, Request::DeleteTransaction { id: "t1".into() });

        let err = Request::decode("TOTALLY_NEW", &Value::Null).unwrap_err();
        assert_eq!(err.code(), "BRIDGE/UNKNOWN_TYPE");

        let err = Request::decode("DELETE_TRANSACTION", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION/MISSING_ID");
    }

    #[test]
    fn delete_partner_accepts_string_and_numeric_ids() {
        let req = Request::decode("DELETE_PARTNER", &serde_json::json!({ "id": 3 })).unwrap();
        assert_eq!(req, Request::DeletePartner { id: 3 });
        let req = Request::decode("DELETE_PARTNER", &serde_json::json!({ "id": "4" })).unwrap();
        assert_eq!(req, Request::DeletePartner { id: 4 });
        assert!(Request::decode("DELETE_PARTNER", &serde_json::json!({ "id": "x" })).is_err());
    }

    #[test]
    fn import_data_accepts_content_string_and_state_object() {
        let inline = serde_json::json!({
            "state": { "transactions": [ { "id": "t1" } ], "partners": [] }
        });
        let Request::ImportData(snap) = Request::decode("IMPORT_DATA", &inline).unwrap() else {
            panic!("expected ImportData");
        };
        assert_eq!(snap.transactions.len(), 1);

        let content = serde_json::json!({
            "content": "{\"transactions\":[{\"id\":\"t2\"}],\"partners\":[]}"
        });
        let Request::ImportData(snap) = Request::decode("IMPORT_DATA", &content).unwrap() else {
            panic!("expected ImportData");
        };
        assert_eq!(snap.transactions[0].id, "t2");

        let broken = serde_json::json!({ "content": "{not json" });
        assert!(Request::decode("IMPORT_DATA", &broken).is_err());
    }
}
