//! Command-line probe over the ledgerkeep audit trail.
//!
//! # Responsibility
//! - Verify core linkage (`ping`).
//! - Print audit history and change listings as JSON lines.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledgerkeep_core::{
    open_db, AuditQuery, AuditRepository, ChangeType, CoreConfig, SqliteAuditRepository,
};
use log::info;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ledgerkeep")]
#[command(about = "ledgerkeep audit trail CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print core ping and version
    Ping,

    /// Print the full audit history of one entity
    History {
        /// SQLite file (defaults to LEDGERKEEP_DB_PATH)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Entity type name (e.g. Order)
        #[arg(long)]
        entity_type: String,

        /// Entity id (UUID)
        #[arg(long)]
        entity_id: String,
    },

    /// List entity changes, oldest first
    Changes {
        /// SQLite file (defaults to LEDGERKEEP_DB_PATH)
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(long)]
        entity_type: Option<String>,

        /// created | updated | deleted
        #[arg(long)]
        change_type: Option<String>,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CoreConfig::from_env().context("read LEDGERKEEP_* environment")?;
    ledgerkeep_core::init_logging_from_config(&config)
        .map_err(anyhow::Error::msg)
        .context("init logging")?;

    match cli.cmd {
        Commands::Ping => {
            println!("ledgerkeep_core ping={}", ledgerkeep_core::ping());
            println!("ledgerkeep_core version={}", ledgerkeep_core::core_version());
        }

        Commands::History {
            db,
            entity_type,
            entity_id,
        } => {
            let entity_id = Uuid::parse_str(&entity_id)
                .with_context(|| format!("invalid entity id `{entity_id}`"))?;
            let conn = open_db(resolve_db_path(db, &config)?).context("open database")?;
            let repo = SqliteAuditRepository::new(&conn);
            let history = repo
                .entity_history(&entity_type, entity_id)
                .context("read entity history")?;
            info!(
                "event=cli_history module=cli status=ok entity_type={} entity_id={} entries={}",
                entity_type,
                entity_id,
                history.len()
            );
            for entry in &history {
                println!("{}", serde_json::to_string(entry).context("encode entry")?);
            }
        }

        Commands::Changes {
            db,
            entity_type,
            change_type,
            limit,
            offset,
        } => {
            let change_type = match change_type.as_deref() {
                Some(value) => match ChangeType::parse(value) {
                    Some(parsed) => Some(parsed),
                    None => bail!("unknown change type `{value}`; expected created|updated|deleted"),
                },
                None => None,
            };
            let conn = open_db(resolve_db_path(db, &config)?).context("open database")?;
            let repo = SqliteAuditRepository::new(&conn);
            let query = AuditQuery {
                entity_type,
                entity_id: None,
                change_type,
                limit,
                offset,
            };
            let changes = repo
                .list_entity_changes(&query)
                .context("list entity changes")?;
            for change in &changes {
                println!("{}", serde_json::to_string(change).context("encode change")?);
            }
        }
    }

    Ok(())
}

fn resolve_db_path(flag: Option<PathBuf>, config: &CoreConfig) -> Result<PathBuf> {
    match flag.or_else(|| config.db_path.clone()) {
        Some(path) => Ok(path),
        None => bail!("no database: pass --db or set LEDGERKEEP_DB_PATH"),
    }
}
