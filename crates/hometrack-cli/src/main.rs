use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use hometrack_core::{ConflictId, Property, PropertyId, SearchQuery};
use hometrack_storage::{open_store, PropertyStore};
use hometrack_sync::{open_index, run_ingest, SyncConfig};
use hometrack_web::PropertyDetail;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hometrack")]
#[command(about = "Multi-source listing history reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest JSON-lines message files and write a run report.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Search the index with key=value filters, e.g. `type=condo max_price=500000`.
    Search {
        filters: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print one property by identifier or address.
    Show {
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        address: Option<String>,
        /// Include the full history and conflict records.
        #[arg(long)]
        history: bool,
    },
    /// Mark a conflict as manually resolved.
    Resolve {
        property_id: String,
        conflict_id: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Serve the JSON query API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Ingest { files } => {
            let summary = run_ingest(&config, &files).await?;
            println!(
                "ingest complete: run_id={} records={} committed={} unchanged={} dead_lettered={} lost={} malformed_lines={} new_conflicts={} near_duplicates={}",
                summary.run_id,
                summary.stats.records,
                summary.stats.committed,
                summary.stats.unchanged,
                summary.stats.dead_lettered,
                summary.stats.dead_letter_failures,
                summary.stats.malformed_lines,
                summary.stats.new_conflicts,
                summary.near_duplicates.len()
            );
        }
        Commands::Search { filters, json } => {
            let query = parse_filters(&filters)?;
            let (_, index) = open_index(&config).await?;
            let page = index.search_page(&query).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                for property in &page.properties {
                    println!("{}", summary_line(property));
                }
                if let Some(next) = &page.next_after {
                    println!("more results: after={next}");
                }
            }
        }
        Commands::Show { id, address, history } => {
            let (store, index) = open_index(&config).await?;
            let id = match (id, address) {
                (Some(id), _) => PropertyId::parse(&id).ok_or_else(|| anyhow!("{id:?} is not a property id"))?,
                (None, Some(address)) => {
                    let entry = index
                        .get_by_address(&address)
                        .await?
                        .ok_or_else(|| anyhow!("no property at {address:?}"))?;
                    entry.property.id.clone()
                }
                (None, None) => bail!("pass a property id or --address"),
            };
            let record = store
                .get(&id)
                .await?
                .ok_or_else(|| anyhow!("property {id} not found"))?;
            if history {
                println!("{}", serde_json::to_string_pretty(&PropertyDetail::from_record(&record))?);
            } else {
                println!("{}", serde_json::to_string_pretty(&record.property)?);
            }
        }
        Commands::Resolve {
            property_id,
            conflict_id,
            note,
        } => {
            let id = PropertyId::parse(&property_id)
                .ok_or_else(|| anyhow!("{property_id:?} is not a property id"))?;
            let conflict_id: ConflictId = conflict_id
                .parse()
                .with_context(|| format!("{conflict_id:?} is not a conflict id"))?;
            let store = open_store(&config.database_url).await?;
            let resolution = store.resolve_conflict(&id, conflict_id, note, Utc::now()).await?;
            info!(property_id = %id, %conflict_id, "conflict manually resolved");
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
        Commands::Serve => {
            hometrack_web::serve(&config).await?;
        }
    }

    Ok(())
}

fn parse_filters(filters: &[String]) -> Result<SearchQuery> {
    let pairs = filters
        .iter()
        .map(|f| {
            f.split_once('=')
                .ok_or_else(|| anyhow!("filter {f:?} is not key=value"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(SearchQuery::from_pairs(pairs)?)
}

fn summary_line(property: &Property) -> String {
    let price = property
        .price
        .map(|p| format!("${p:.0}"))
        .unwrap_or_else(|| "-".into());
    format!(
        "{}  {:<8} {:>10}  {}",
        property.id,
        property.status.as_str(),
        price,
        property.address.display_line()
    )
}
