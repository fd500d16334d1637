use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn default_quantity() -> f64 {
    1.0
}

fn default_pricing_mode() -> String {
    "unit".to_string()
}

fn default_currency() -> String {
    "MAD".to_string()
}

/// Accept a nested sub-record list however it arrives: a proper JSON array,
/// a JSON-encoded string (older backups stored the serialized column
/// verbatim), or garbage. Anything unusable resolves to an empty list —
/// a corrupt installments/payouts blob must never sink a whole record.
fn lenient_array<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(parse_json_array(&raw))
}

/// Same leniency for values already in hand (e.g. a TEXT column read back
/// from sqlite).
pub fn parse_json_array(raw: &Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items.clone(),
        Value::String(s) if !s.trim().is_empty() => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Accept a partner id as a number, a numeric string, or absent.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

/// One ledger row. `id` is caller-assigned and globally unique; re-saving
/// with the same id replaces the row.
///
/// Field aliases (`amountBase`, `unitPriceBase`, `paidAmountBase`) match the
/// spellings the presentation layer has emitted across UI generations, so
/// old backups import unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default)]
    pub id: String,
    /// "sale" or "purchase" by convention; stored permissively as text.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub item: String,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    #[serde(default, alias = "unitPriceBase")]
    pub unit_price: f64,
    #[serde(default, alias = "amountBase")]
    pub amount: f64,
    #[serde(default = "default_pricing_mode")]
    pub pricing_mode: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub is_credit: bool,
    #[serde(default)]
    pub client_name: String,
    #[serde(default, alias = "paidAmountBase")]
    pub paid_amount: f64,
    #[serde(default)]
    pub is_fully_paid: bool,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub due_date: String,
    /// Opaque scheduler handle for a pending debt reminder. Non-null means
    /// a live reminder exists; delete/replace paths must cancel it.
    #[serde(default)]
    pub reminder_id: Option<String>,
    #[serde(default)]
    pub is_installment_plan: bool,
    #[serde(default, deserialize_with = "lenient_array")]
    pub installments: Vec<Value>,
    #[serde(default)]
    pub is_mock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    /// Store-assigned unless explicitly supplied on import.
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub invested_base: f64,
    #[serde(default)]
    pub invested_at: String,
    #[serde(default)]
    pub profit_schedule: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, deserialize_with = "lenient_array")]
    pub payouts: Vec<Value>,
    #[serde(default)]
    pub is_mock: bool,
}

/// Full exported/importable representation of store contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub partners: Vec<Partner>,
}

impl Snapshot {
    /// Parse a snapshot leniently: per-record deserialization failures are
    /// logged and the record dropped, never fatal. Unknown fields are
    /// ignored, missing optional fields default.
    pub fn parse(value: &Value) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (key, out) in [("transactions", true), ("partners", false)] {
            let Some(items) = value.get(key).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                if item.is_null() {
                    continue;
                }
                if out {
                    match serde_json::from_value::<Transaction>(item.clone()) {
                        Ok(tx) => snapshot.transactions.push(tx),
                        Err(e) => tracing::warn!(
                            target = "daftar",
                            event = "snapshot_record_skipped",
                            table = "transactions",
                            error = %e
                        ),
                    }
                } else {
                    match serde_json::from_value::<Partner>(item.clone()) {
                        Ok(p) => snapshot.partners.push(p),
                        Err(e) => tracing::warn!(
                            target = "daftar",
                            event = "snapshot_record_skipped",
                            table = "partners",
                            error = %e
                        ),
                    }
                }
            }
        }
        snapshot
    }
}
