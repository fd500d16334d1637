use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use tracing::{error, info};

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        format!("{}…", &trimmed[..160])
    } else {
        trimmed.to_string()
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202601101200_initial.sql",
        include_str!("../migrations/202601101200_initial.sql"),
    ),
    (
        "202601151000_transactions_pricing.sql",
        include_str!("../migrations/202601151000_transactions_pricing.sql"),
    ),
    (
        "202601201500_transactions_credit_plan.sql",
        include_str!("../migrations/202601201500_transactions_credit_plan.sql"),
    ),
    (
        "202602011200_partners_investment.sql",
        include_str!("../migrations/202602011200_partners_investment.sql"),
    ),
    (
        "202602101000_mock_flags.sql",
        include_str!("../migrations/202602101000_mock_flags.sql"),
    ),
    (
        "202602151100_transactions_date_idx.sql",
        include_str!("../migrations/202602151100_transactions_date_idx.sql"),
    ),
];

fn cleaned_sql(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply the embedded migration ladder. Idempotent and safe to run on every
/// startup against a pre-existing store: applied files are skipped by
/// version marker, and `ADD COLUMN` statements are individually guarded so
/// databases created by older installs (which grew columns ad hoc) converge
/// on the same schema without errors.
pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }
    let add_col_re = Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)").unwrap();

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = cleaned_sql(raw_sql);
        let checksum = format!("{:x}", Sha256::digest(cleaned.as_bytes()));

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                anyhow::bail!("migration {} edited after application", filename);
            }
            info!(target = "daftar", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            if let Some(caps) = add_col_re.captures(s) {
                let table = caps.get(1).unwrap().as_str();
                let col = caps.get(2).unwrap().as_str();
                let exists: Option<i64> = sqlx::query_scalar(&format!(
                    "SELECT 1 FROM pragma_table_info('{}') WHERE name='{}'",
                    table, col
                ))
                .fetch_optional(&mut *tx)
                .await?;
                if exists.is_some() {
                    info!(target = "daftar", event = "migration_stmt_skip", file = %filename, sql = %preview(s));
                    continue;
                }
            }
            info!(target = "daftar", event = "migration_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target = "daftar", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target = "daftar", event = "migration_file_applied", file = %filename);
    }

    Ok(())
}

/// Versions recorded in `schema_migrations`, in application order.
pub async fn applied_versions(pool: &SqlitePool) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT version FROM schema_migrations ORDER BY applied_at, version",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
