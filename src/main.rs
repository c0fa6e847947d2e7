use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soundscape::{Catalogue, Dispatcher, Payload};

#[derive(Parser)]
#[command(name = "soundscape", version, about = "Ecoacoustics dataset runtime")]
struct Cli {
    /// Directory holding one subdirectory per dataset
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded datasets
    Datasets,

    /// Run one endpoint and print its JSON result
    Query {
        /// Endpoint name, e.g. fetch_files
        endpoint: String,

        /// Named arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Value printed instead of failing when the query errors
        #[arg(short, long)]
        default: Option<String>,
    },

    /// Print a dataset's option groups
    Options {
        dataset: String,
    },

    /// Print a dataset's site tree
    Tree {
        dataset: String,
    },

    /// Precompute richness and abundance views into the on-disk cache
    Warm {
        dataset: String,

        /// Confidence thresholds (defaults to 0.1 .. 0.9)
        #[arg(short, long, value_delimiter = ',')]
        threshold: Vec<f64>,

        /// Group-by column sets, comma separated within a set; repeatable
        #[arg(short, long = "group-by")]
        group_by: Vec<String>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },
}

fn parse_payload(text: &str) -> Result<Payload> {
    match serde_json::from_str::<serde_json::Value>(text).context("Payload is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("Payload must be a JSON object, got {other}"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = soundscape::config::AppConfig::load();

    // Resolve dataset root: CLI > config > XDG default
    let root = config.resolve_root(cli.root);
    log::info!("Dataset root: {}", root.display());

    let catalogue = Catalogue::open(&root, config.catalogue_options())
        .with_context(|| format!("Failed to load datasets from {}", root.display()))?;
    let dispatcher = Dispatcher::new(Arc::new(catalogue));

    match cli.command {
        Commands::Datasets => {
            for ds in dispatcher.catalogue().iter() {
                println!("{:<24} {}", ds.name(), ds.root().display());
            }
        }

        Commands::Query { endpoint, payload, default } => {
            let payload = parse_payload(&payload)?;
            let result = match default {
                Some(default) => {
                    let default = serde_json::from_str(&default).context("Default is not valid JSON")?;
                    dispatcher.dispatch(&endpoint, default, &payload)
                }
                None => dispatcher
                    .try_dispatch(&endpoint, &payload)
                    .with_context(|| format!("Query {endpoint} failed"))?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Options { dataset } => {
            let ds = dispatcher
                .catalogue()
                .get(&dataset)
                .with_context(|| format!("Unknown dataset {dataset}"))?;
            let groups = soundscape::options::options_of(ds).context("Failed to build options")?;
            for group in &groups.0 {
                println!("{}", group.name);
                for option in &group.options {
                    println!("  {:<28} {:<24} {:?}", option.value, option.label, option.kind);
                }
            }
        }

        Commands::Tree { dataset } => {
            let ds = dispatcher
                .catalogue()
                .get(&dataset)
                .with_context(|| format!("Unknown dataset {dataset}"))?;
            let tree = ds.sites_tree().context("Failed to build site tree")?;
            for path in tree.paths() {
                let depth = path.matches('/').count();
                let leaf = path.rsplit('/').next().unwrap_or(&path);
                println!("{}{}", "  ".repeat(depth), leaf);
            }
        }

        Commands::Warm { dataset, threshold, group_by, jobs } => {
            let ds = dispatcher
                .catalogue()
                .get(&dataset)
                .with_context(|| format!("Unknown dataset {dataset}"))?;
            let thresholds = if threshold.is_empty() {
                soundscape::warm::DEFAULT_THRESHOLDS.to_vec()
            } else {
                threshold
            };
            let group_bys: Vec<Vec<String>> = if group_by.is_empty() {
                vec![Vec::new()]
            } else {
                group_by
                    .iter()
                    .map(|set| set.split(',').map(|c| c.trim().to_string()).collect())
                    .collect()
            };
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result = soundscape::warm::warm_views(
                ds,
                dispatcher.catalogue().cache(),
                &thresholds,
                &group_bys,
                workers,
                true,
            )
            .context("Warm failed")?;
            println!(
                "Warm complete: {} views computed, {} failed",
                result.computed, result.failed
            );
        }
    }

    Ok(())
}
