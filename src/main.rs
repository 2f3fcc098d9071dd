// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{bail, Context, Result};
use bankgreen::brand::{create_brand, create_brand_from_record, find_duplicates, get_brand_by_tag, NewBrand};
use bankgreen::datasource::{count_by_kind, find_record, get_record, link_record, unlink_record, DatasourceKind};
use bankgreen::matching::{auto_link, suggest_brands};
use bankgreen::{config, import_csv, logging, open_database};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

const CLI_ACTOR: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "bankgreen", version, about = "Bank catalog administration")]
struct Cli {
    /// SQLite database
    #[arg(long, global = true, env = "BANKGREEN_DB", default_value = config::DEFAULT_DATABASE)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a provider CSV
    Import {
        /// Provider code, e.g. usnic
        kind: String,
        file: PathBuf,
    },
    /// Link a record to a brand
    Link {
        /// Record id, or <kind>:<source_id>
        record: String,
        /// Brand tag
        brand: String,
    },
    /// Remove a record's brand link
    Unlink { record: String },
    /// Show brand suggestions for a record
    Suggest { record: String },
    /// Link unlinked records of a provider that have one exact match
    Autolink { kind: String },
    /// Create a brand, or one derived from a record with --from-record
    CreateBrand {
        /// Brand name (ignored with --from-record)
        #[arg(required_unless_present = "from_record")]
        name: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value = "")]
        website: String,
        #[arg(long)]
        from_record: Option<String>,
    },
    /// List brands whose tags share a stem
    Duplicates,
    /// Record counts per provider
    Stats,
    /// Browse the admin changelists in the terminal
    Admin,
}

fn main() -> Result<()> {
    config::load_dotenv();
    logging::init();
    let cli = Cli::parse();

    let db_path = cli.db;
    let conn = open_database(&db_path).with_context(|| format!("Failed to open database {}", db_path.display()))?;

    match cli.command {
        Command::Import { kind, file } => run_import(&conn, &kind, &file),
        Command::Link { record, brand } => {
            let record_id = resolve_record(&conn, &record)?;
            let brand = get_brand_by_tag(&conn, &brand)?;
            let linked = link_record(&conn, record_id, brand.id, CLI_ACTOR)?;
            println!("✓ {} ({}) → {}", linked.name, linked.kind, brand.tag);
            Ok(())
        }
        Command::Unlink { record } => {
            let record_id = resolve_record(&conn, &record)?;
            let record = unlink_record(&conn, record_id, CLI_ACTOR)?;
            println!("✓ {} ({}) unlinked", record.name, record.kind);
            Ok(())
        }
        Command::Suggest { record } => run_suggest(&conn, &record),
        Command::Autolink { kind } => {
            let kind: DatasourceKind = kind.parse()?;
            let report = auto_link(&conn, kind, CLI_ACTOR)?;
            println!(
                "✓ {}: {} linked, {} ambiguous, {} unmatched",
                kind.name(),
                report.linked,
                report.ambiguous,
                report.unmatched
            );
            Ok(())
        }
        Command::CreateBrand {
            name,
            tag,
            website,
            from_record,
        } => {
            let brand = match (from_record, name) {
                (Some(record), _) => create_brand_from_record(&conn, resolve_record(&conn, &record)?, CLI_ACTOR)?,
                (None, Some(name)) => create_brand(
                    &conn,
                    NewBrand {
                        tag,
                        website,
                        ..NewBrand::named(name)
                    },
                    CLI_ACTOR,
                )?,
                (None, None) => bail!("a brand name or --from-record is required"),
            };
            println!("✓ Brand {} ({}) created", brand.name, brand.tag);
            Ok(())
        }
        Command::Duplicates => run_duplicates(&conn),
        Command::Stats => run_stats(&conn),
        Command::Admin => run_ui_mode(&conn),
    }
}

/// Accept a numeric id or `<kind>:<source_id>`
fn resolve_record(conn: &Connection, reference: &str) -> Result<i64> {
    if let Ok(id) = reference.parse::<i64>() {
        return Ok(get_record(conn, id)?.id);
    }
    let Some((kind, source_id)) = reference.split_once(':') else {
        bail!("record must be an id or <kind>:<source_id>, got '{}'", reference);
    };
    let kind: DatasourceKind = kind.parse()?;
    match find_record(conn, kind, source_id)? {
        Some(record) => Ok(record.id),
        None => bail!("no {} record with source id '{}'", kind, source_id),
    }
}

fn run_import(conn: &Connection, kind: &str, file: &Path) -> Result<()> {
    let kind: DatasourceKind = kind.parse()?;
    println!("📂 Importing {} records from {}", kind.name(), file.display());

    let stats = import_csv(conn, file, kind, CLI_ACTOR).with_context(|| format!("Failed to import {}", file.display()))?;

    println!("✓ {} rows processed", stats.total());
    println!("  inserted:  {}", stats.inserted);
    println!("  updated:   {}", stats.updated);
    println!("  unchanged: {}", stats.unchanged);
    Ok(())
}

fn run_suggest(conn: &Connection, reference: &str) -> Result<()> {
    let record = get_record(conn, resolve_record(conn, reference)?)?;
    let brands = bankgreen::brand::all_brands(conn)?;
    let suggestions = suggest_brands(&record, &brands);

    println!("🔍 Suggestions for {} ({})", record.name, record.kind);
    if suggestions.is_empty() {
        println!("   none within edit distance {}", bankgreen::LEV_DISTANCE);
    }
    for s in suggestions {
        let marker = if s.website_match { "website" } else { "name" };
        println!("   {:<30} distance {} ({})", s.tag, s.distance, marker);
    }
    Ok(())
}

fn run_duplicates(conn: &Connection) -> Result<()> {
    let groups = find_duplicates(conn)?;
    if groups.is_empty() {
        println!("✓ No duplicate tag stems");
    }
    for group in groups {
        let tags: Vec<&str> = group.brands.iter().map(|b| b.tag.as_str()).collect();
        println!("{}: {}", group.stem, tags.join(", "));
    }
    Ok(())
}

fn run_stats(conn: &Connection) -> Result<()> {
    println!("{:<20} {:>8} {:>8}", "provider", "records", "linked");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (kind, total, linked) in count_by_kind(conn)? {
        println!("{:<20} {:>8} {:>8}", kind.name(), total, linked);
    }
    Ok(())
}

#[cfg(feature = "tui")]
fn run_ui_mode(conn: &Connection) -> Result<()> {
    let mut app = ui::App::new(conn)?;
    ui::run_ui(&mut app, conn)?;
    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_ui_mode(_conn: &Connection) -> Result<()> {
    bail!("TUI mode not available, rebuild with: cargo build --features tui")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_path_from_env_and_flag() {
        std::env::set_var("BANKGREEN_DB", "/srv/bankgreen/catalog.sqlite3");

        let cli = Cli::try_parse_from(["bankgreen", "stats"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("/srv/bankgreen/catalog.sqlite3"));

        let cli = Cli::try_parse_from(["bankgreen", "stats", "--db", "local.sqlite3"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("local.sqlite3"));

        std::env::remove_var("BANKGREEN_DB");
        let cli = Cli::try_parse_from(["bankgreen", "stats"]).unwrap();
        assert_eq!(cli.db, PathBuf::from(config::DEFAULT_DATABASE));
    }
}
