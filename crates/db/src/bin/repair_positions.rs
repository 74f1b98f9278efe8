//! CLI tool to find and repair non-dense sibling positions.
//!
//! Every board's columns and every column's tasks must sit at positions
//! `0..n`. Rows written outside the ordering module (manual SQL, restored
//! backups) can leave gaps or duplicates; this tool reports them and, with
//! `--execute`, renumbers each affected parent in its existing order.
//!
//! Usage:
//!   cargo run --bin repair_positions              # Dry-run (default)
//!   cargo run --bin repair_positions -- --execute # Renumber positions
//!   cargo run --bin repair_positions -- --verbose # Show every parent checked
//!   cargo run --bin repair_positions -- --json    # Machine-readable report

use std::env;
use std::io::{self, Write};

use db::{
    DBService,
    models::{board::Board, column::Column, task::Task},
    ordering::{self, DensityReport},
};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
enum Level {
    Columns,
    Tasks,
}

struct Finding {
    level: Level,
    report: DensityReport,
}

#[derive(Default)]
struct RepairResult {
    repaired: usize,
    rows_changed: u64,
    errors: usize,
}

async fn scan(pool: &SqlitePool, verbose: bool) -> anyhow::Result<Vec<Finding>> {
    let mut findings = Vec::new();

    for board in Board::find_all(pool).await? {
        let report = ordering::check_density::<Column>(pool, board.id).await?;
        if verbose {
            println!("  board {} ({}): {}", board.name, board.id, report);
        }
        if !report.is_dense() {
            findings.push(Finding {
                level: Level::Columns,
                report,
            });
        }

        for column in Column::find_by_board(pool, board.id).await? {
            let report = ordering::check_density::<Task>(pool, column.id).await?;
            if verbose {
                println!("    column {} ({}): {}", column.title, column.id, report);
            }
            if !report.is_dense() {
                findings.push(Finding {
                    level: Level::Tasks,
                    report,
                });
            }
        }
    }

    Ok(findings)
}

async fn repair(pool: &SqlitePool, finding: &Finding) -> Result<u64, ordering::OrderingError> {
    match finding.level {
        Level::Columns => ordering::normalize::<Column>(pool, finding.report.parent_id).await,
        Level::Tasks => ordering::normalize::<Task>(pool, finding.report.parent_id).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let execute = args.iter().any(|a| a == "--execute");
    let verbose = args.iter().any(|a| a == "--verbose");
    let json = args.iter().any(|a| a == "--json");

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Repair Positions");
        println!();
        println!("Finds boards and columns whose children have gapped or duplicated positions.");
        println!();
        println!("Usage:");
        println!("  cargo run --bin repair_positions              Dry-run mode (default)");
        println!("  cargo run --bin repair_positions -- --execute Renumber affected parents");
        println!("  cargo run --bin repair_positions -- --verbose Show every parent checked");
        println!("  cargo run --bin repair_positions -- --json    Print findings as JSON");
        println!("  cargo run --bin repair_positions -- --help    Show this help");
        return Ok(());
    }

    // Console logs share stdout with the JSON report
    let log_level = match (json, verbose) {
        (true, _) => "warn",
        (false, true) => "debug",
        (false, false) => "info",
    };
    let _log_guard = utils::logging::init_logging(log_level);

    info!("Connecting to database...");
    let db = DBService::new().await?;
    let pool = db.pool();

    info!("Scanning sibling positions...");
    let findings = scan(&pool, verbose && !json).await?;

    if json {
        let reports: Vec<&DensityReport> = findings.iter().map(|f| &f.report).collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
        if !execute {
            return Ok(());
        }
    } else {
        println!("=== Position Repair Tool ===");
        println!();
        if !execute {
            println!("Running in DRY-RUN mode. No changes will be made.");
            println!("Use --execute to renumber positions.");
            println!();
        }
        println!("Found {} parent(s) with non-dense positions:", findings.len());
        for finding in &findings {
            println!(
                "  - {} (duplicates: {})",
                finding.report,
                finding.report.duplicates()
            );
        }
        println!();
    }

    if findings.is_empty() {
        if !json {
            println!("All positions are dense. Nothing to repair!");
        }
        return Ok(());
    }

    if !execute {
        println!("Dry-run complete. Run with --execute to repair these parents.");
        return Ok(());
    }

    if !json {
        print!("Renumber positions under {} parent(s)? [y/N] ", findings.len());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let mut result = RepairResult::default();
    for finding in &findings {
        match repair(&pool, finding).await {
            Ok(changed) => {
                info!(
                    parent_kind = finding.report.parent_kind,
                    parent_id = %finding.report.parent_id,
                    changed = changed,
                    "Repaired positions"
                );
                result.repaired += 1;
                result.rows_changed += changed;
            }
            Err(e) => {
                error!(
                    parent_id = %finding.report.parent_id,
                    error = %e,
                    "Failed to repair positions"
                );
                result.errors += 1;
            }
        }
    }

    if !json {
        println!();
        println!("=== Repair Complete ===");
        println!("Parents repaired: {}", result.repaired);
        println!("Rows renumbered: {}", result.rows_changed);
        println!("Errors: {}", result.errors);
    }

    if result.errors > 0 {
        warn!("Some parents could not be repaired. Check logs for details.");
    }

    Ok(())
}
