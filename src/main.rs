use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

use daftar_lib::ipc::{Dispatch, Dispatcher};
use daftar_lib::model::Snapshot;
use daftar_lib::reminders::LogNotifier;
use daftar_lib::security::{FileSecretStore, NoBiometrics};
use daftar_lib::{db, migrate, snapshot, AppState};

#[derive(Debug, Parser)]
#[command(name = "daftar", about = "Daftar bookkeeping data core", version)]
struct Cli {
    /// Path to the sqlite database. Defaults to the per-user data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the line-delimited request protocol over stdin/stdout.
    Serve,
    /// Database maintenance and inspection commands.
    #[command(subcommand)]
    Db(DbCommand),
    /// Write the full data snapshot as JSON.
    Export {
        /// Output file. Writes to stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Replace all data with the snapshot read from FILE.
    Import { file: PathBuf },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Report integrity, applied migrations, and row counts.
    Status,
}

#[tokio::main]
async fn main() {
    daftar_lib::init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path().context("determine database path")?,
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&db_path).await,
        Commands::Db(DbCommand::Status) => db_status(&db_path).await,
        Commands::Export { out } => export(&db_path, out.as_deref()).await,
        Commands::Import { file } => import(&db_path, &file).await,
    }
}

async fn open_store(db_path: &Path) -> Result<AppState> {
    let pool = db::open_sqlite_pool(db_path).await?;
    migrate::apply_migrations(&pool).await?;

    let secrets_path = db_path
        .parent()
        .map(|dir| dir.join("secrets.json"))
        .unwrap_or_else(|| PathBuf::from("secrets.json"));
    Ok(AppState::new(
        pool,
        Arc::new(LogNotifier),
        Arc::new(FileSecretStore::new(secrets_path)),
        Arc::new(NoBiometrics),
    ))
}

/// Read newline-delimited request envelopes from stdin, answer on stdout.
/// Requests are handled concurrently; each response is one line.
async fn serve(db_path: &Path) -> Result<i32> {
    let state = open_store(db_path).await?;
    let dispatcher = Arc::new(Dispatcher::new(state));
    tracing::info!(target = "daftar", event = "serve_started", db = %db_path.display());

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let exit = Arc::new(Notify::new());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = exit.notified() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("read request line")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let dispatcher = dispatcher.clone();
                let out = out_tx.clone();
                let exit = exit.clone();
                tokio::spawn(async move {
                    match dispatcher.handle(&line).await {
                        Dispatch::Reply(response) => {
                            let _ = out.send(response);
                        }
                        Dispatch::Silent => {}
                        Dispatch::Exit => exit.notify_one(),
                    }
                });
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    tracing::info!(target = "daftar", event = "serve_stopped");
    Ok(0)
}

async fn db_status(db_path: &Path) -> Result<i32> {
    let pool = db::open_sqlite_pool(db_path).await?;

    let integrity: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_one(&pool)
        .await
        .context("run integrity check")?;
    let versions = migrate::applied_versions(&pool).await?;
    let transactions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
        .fetch_one(&pool)
        .await
        .unwrap_or(0);
    let partners: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM partners")
        .fetch_one(&pool)
        .await
        .unwrap_or(0);

    println!("Database     : {}", db_path.display());
    println!("Integrity    : {integrity}");
    println!("Transactions : {transactions}");
    println!("Partners     : {partners}");
    println!("\nApplied migrations:");
    if versions.is_empty() {
        println!("  (none)");
    } else {
        for version in &versions {
            println!("  {version}");
        }
    }

    pool.close().await;
    Ok(if integrity == "ok" { 0 } else { 1 })
}

async fn export(db_path: &Path, out: Option<&Path>) -> Result<i32> {
    let state = open_store(db_path).await?;
    let snap = snapshot::export_snapshot(&state.store).await?;
    let serialized = serde_json::to_string_pretty(&snap).context("serialize snapshot")?;

    match out {
        Some(path) => {
            std::fs::write(path, serialized)
                .with_context(|| format!("write snapshot to {}", path.display()))?;
            println!(
                "Exported {} transactions and {} partners to {}",
                snap.transactions.len(),
                snap.partners.len(),
                path.display()
            );
        }
        None => println!("{serialized}"),
    }

    state.store.pool().close().await;
    Ok(0)
}

async fn import(db_path: &Path, file: &Path) -> Result<i32> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("read snapshot from {}", file.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).context("parse snapshot JSON")?;
    let snap = Snapshot::parse(&value);

    let state = open_store(db_path).await?;
    let counts = snapshot::import_snapshot(&state.store, &state.scheduler, &snap).await?;
    println!(
        "Imported {} transactions and {} partners.",
        counts.transactions, counts.partners
    );

    state.store.pool().close().await;
    Ok(0)
}

fn default_db_path() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("DAFTAR_DATA_DIR") {
        return Ok(PathBuf::from(dir).join("daftar.sqlite3"));
    }

    let base = dirs::data_dir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| anyhow::anyhow!("failed to resolve application data directory"))?;
    Ok(base.join("daftar").join("daftar.sqlite3"))
}
