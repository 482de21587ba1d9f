//! Operator CLI for ledger maintenance.
//!
//! `reconcile` reports drift between stored aggregates and the unit store and
//! can correct it. `purge` physically removes soft-deleted admin-stock units;
//! it is a dry run unless `--apply` is given.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use equiptrack_core::CategoryId;
use equiptrack_infra::store::postgres::PostgresLedgerStore;
use equiptrack_infra::{
    Ledger, LedgerConfig, LedgerStores, PurgeReport, ReconciliationReport, RunMode, Scope,
};
use equiptrack_inventory::ItemKey;

#[derive(Parser, Debug)]
#[command(name = "equiptrack-maintenance", version, about = "Inventory ledger maintenance")]
struct Cli {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    /// Connection pool size
    #[arg(long, default_value_t = 4)]
    max_connections: u32,

    /// Apply the bundled schema before running
    #[arg(long)]
    migrate: bool,

    /// Print the report as JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare stored aggregates with a recomputation from units
    Reconcile {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Rewrite drifted aggregate rows
        #[arg(long)]
        correct: bool,
    },

    /// Remove soft-deleted admin-stock units (dry run by default)
    Purge {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Actually delete; without this nothing is written
        #[arg(long)]
        apply: bool,

        /// Actor recorded on removal records
        #[arg(long, default_value = "maintenance")]
        processed_by: String,
    },
}

/// Limit a run to one item key; both flags or neither.
#[derive(Args, Debug)]
struct ScopeArgs {
    #[arg(long, requires = "category")]
    item_type: Option<String>,

    #[arg(long, requires = "item_type")]
    category: Option<String>,
}

impl ScopeArgs {
    fn to_scope(&self) -> Result<Scope> {
        match (&self.item_type, &self.category) {
            (None, None) => Ok(Scope::All),
            (Some(item_type), Some(category)) => {
                let category = CategoryId::parse(category.as_str())
                    .with_context(|| format!("invalid category id {category:?}"))?;
                let key = ItemKey::new(item_type.as_str(), category)
                    .with_context(|| format!("invalid item type {item_type:?}"))?;
                Ok(Scope::key(key))
            }
            _ => bail!("--item-type and --category must be given together"),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Output {
    Reconcile {
        report: ReconciliationReport,
        corrected: usize,
    },
    Purge(PurgeReport),
}

fn main() -> Result<()> {
    equiptrack_observability::init();
    let cli = Cli::parse();

    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;
    let store = PostgresLedgerStore::connect(&cli.database_url, cli.max_connections)
        .context("connecting to the ledger database")?;
    if cli.migrate {
        store.migrate().context("applying ledger schema")?;
        info!("ledger schema applied");
    }
    let ledger = Ledger::new(config, LedgerStores::postgres(store), None)
        .context("building ledger services")?;

    let output = run(&ledger, &cli.command)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&output);
    }
    Ok(())
}

fn run(ledger: &Ledger, command: &Commands) -> Result<Output> {
    match command {
        Commands::Reconcile { scope, correct } => {
            let scope = scope.to_scope()?;
            let report = ledger.reconciliation().reconcile(&scope)?;
            let corrected = if *correct && report.drift_count() > 0 {
                ledger.reconciliation().correct_drift(&scope)?.len()
            } else {
                0
            };
            Ok(Output::Reconcile { report, corrected })
        }
        Commands::Purge {
            scope,
            apply,
            processed_by,
        } => {
            let scope = scope.to_scope()?;
            let mode = if *apply { RunMode::Apply } else { RunMode::DryRun };
            let report = ledger.reconciliation().purge(&scope, mode, processed_by)?;
            Ok(Output::Purge(report))
        }
    }
}

fn print_summary(output: &Output) {
    match output {
        Output::Reconcile { report, corrected } => {
            println!("scope: {}", report.scope);
            println!("keys checked: {}", report.entries.len());
            println!("drifted: {}", report.drift_count());
            for entry in report.entries.iter().filter(|e| e.drifted()) {
                println!(
                    "  {}: stored {:?}, recomputed {:?}",
                    entry.key, entry.stored, entry.recomputed
                );
            }
            println!("purge eligible: {}", report.purge_eligible_count());
            if *corrected > 0 {
                println!("corrected: {corrected}");
            }
        }
        Output::Purge(report) => {
            let verb = match report.mode {
                RunMode::DryRun => "would purge",
                RunMode::Apply => "purged",
            };
            println!("scope: {}", report.scope);
            println!("{verb}: {}", report.purged.len());
            for entry in &report.purged {
                println!("  {} ({})", entry.unit_id, entry.key);
            }
            println!("skipped: {}", report.skipped.len());
            for skipped in &report.skipped {
                println!("  {}: {}", skipped.unit_id, skipped.reason);
            }
            if !report.drifted.is_empty() {
                println!("drifted before run: {}", report.drifted.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut argv = vec!["equiptrack-maintenance", "--database-url", "postgres://x"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn purge_defaults_to_dry_run_over_everything() {
        let cli = parse(&["purge"]).unwrap();
        match cli.command {
            Commands::Purge {
                scope,
                apply,
                processed_by,
            } => {
                assert!(!apply);
                assert_eq!(processed_by, "maintenance");
                assert_eq!(scope.to_scope().unwrap(), Scope::All);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn scope_needs_both_item_type_and_category() {
        assert!(parse(&["reconcile", "--item-type", "Dell01"]).is_err());

        let cli = parse(&[
            "reconcile",
            "--item-type",
            "Dell01",
            "--category",
            "cat-laptops",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        let Commands::Reconcile { scope, correct } = cli.command else {
            panic!("expected reconcile");
        };
        assert!(!correct);
        let expected = ItemKey::new("Dell01", CategoryId::parse("cat-laptops").unwrap()).unwrap();
        assert_eq!(scope.to_scope().unwrap(), Scope::key(expected));
    }
}
