//! Metadata query CLI
//!
//! Builds a local cluster of in-memory shards, seeds it from a series
//! generator through the regular write path, runs one metadata operation and
//! prints the aggregate as JSON.
//!
//! # Configuration
//!
//! Settings come from the file given with `--config` (plus environment
//! overrides), or from the environment alone. Command-line flags win.
//!
//! # Example Usage
//!
//! ```bash
//! # Tag keys and values of every cpu series in the last week
//! metaq tags '$key' = cpu
//!
//! # Keys seen in a fixed window, at most 5
//! metaq keys --start 2024-01-01/00:00 --end 2024-01-02/00:00 --limit 5
//!
//! # Values of the host tag, tolerating shard failures
//! metaq --shards 8 tag-value-suggest --partial --key host
//!
//! # Tag suggestions for a half-typed value
//! metaq tag-suggest --key host --value web
//! ```

use clap::{Args, Parser, Subcommand};
use kuba_metadata::cache::MetadataQueryCache;
use kuba_metadata::cluster::{
    AggregateOutcome, ClusterDispatch, ClusterManager, DispatchOptions, InMemoryShard,
    MatchOptions, ShardClient, StaticClusterGroup,
};
use kuba_metadata::config::Config;
use kuba_metadata::filter::QueryGrammar;
use kuba_metadata::generator::GeneratorRegistry;
use kuba_metadata::metrics;
use kuba_metadata::service::{
    KeySuggestBody, MetadataService, TagSuggestBody, TagValueSuggestBody, TagValuesSuggestBody,
};
use kuba_metadata::shell::{format_time_nanos, QueryParams};
use kuba_metadata::types::Series;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// CLI Definition
// =============================================================================

/// Kuba Metadata - query series metadata across a sharded cluster
#[derive(Parser)]
#[command(name = "metaq")]
#[command(version)]
#[command(about = "Run metadata queries against a local sharded cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Override the number of local shards
    #[arg(long, global = true)]
    shards: Option<usize>,

    /// Override the series generator (random, sine)
    #[arg(long, global = true)]
    generator: Option<String>,

    /// Override the number of generated series
    #[arg(long, global = true)]
    series: Option<usize>,

    /// Override the generator seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Print Prometheus metrics to stderr when done
    #[arg(long, global = true)]
    print_metrics: bool,
}

/// Query parameters plus dispatch flags
#[derive(Args, Debug, Clone)]
struct QueryArgs {
    /// Accept results from a subset of shards
    #[arg(long)]
    partial: bool,

    #[command(flatten)]
    params: QueryParams,
}

/// Fuzzy matching flags for suggestions
#[derive(Args, Debug, Clone)]
struct MatchArgs {
    /// Disable fuzzy matching
    #[arg(long)]
    no_fuzzy: bool,

    /// Leading characters a fuzzy match must share
    #[arg(long, default_value_t = 2)]
    prefix_length: usize,

    /// Maximum fuzzy expansions per shard
    #[arg(long, default_value_t = 20)]
    max_expansions: usize,
}

impl MatchArgs {
    fn options(&self) -> MatchOptions {
        MatchOptions {
            fuzzy: !self.no_fuzzy,
            prefix_length: self.prefix_length,
            max_expansions: self.max_expansions,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Tag keys and values of matching series
    Tags(QueryArgs),

    /// Distinct series keys
    Keys(QueryArgs),

    /// Matching series
    Series(QueryArgs),

    /// Delete matching series
    DeleteSeries(QueryArgs),

    /// Write one series
    AddSeries {
        /// Series key
        key: String,

        /// Tags as key=value, repeatable
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Count matching series
    SeriesCount(QueryArgs),

    /// Series count per tag key
    TagkeyCount(QueryArgs),

    /// Suggest series keys
    KeySuggest {
        /// Text to match keys against
        #[arg(long)]
        key: Option<String>,

        #[command(flatten)]
        matching: MatchArgs,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Suggest tag key/value pairs
    TagSuggest {
        /// Text to match tag keys against
        #[arg(long)]
        key: Option<String>,

        /// Text to match tag values against
        #[arg(long)]
        value: Option<String>,

        #[command(flatten)]
        matching: MatchArgs,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Values of one tag key
    TagValueSuggest {
        /// Tag key
        #[arg(long)]
        key: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Values grouped by tag key
    TagValuesSuggest {
        /// Tag keys to leave out, repeatable
        #[arg(long)]
        exclude: Vec<String>,

        /// Values kept per key
        #[arg(long, default_value_t = 10)]
        group_limit: usize,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Validate configuration and print it
    CheckConfig,
}

fn parse_tag(text: &str) -> Result<(String, String), String> {
    text.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", text))
}

// =============================================================================
// Setup
// =============================================================================

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file_with_env(&path.to_string_lossy())?,
        None => Config::from_env(),
    };

    if let Some(shards) = cli.shards {
        config.cluster.shards = shards;
    }
    if let Some(generator) = &cli.generator {
        config.generator.name = generator.clone();
    }
    if let Some(series) = cli.series {
        config.generator.series = series;
    }
    if let Some(seed) = cli.seed {
        config.generator.seed = seed;
    }

    config.validate()?;
    Ok(config)
}

fn build_service(config: &Config) -> MetadataService {
    let shards: Vec<Arc<dyn ShardClient>> = (0..config.cluster.shards)
        .map(|i| Arc::new(InMemoryShard::new(format!("shard-{}", i))) as Arc<dyn ShardClient>)
        .collect();

    let group = StaticClusterGroup::new(config.cluster.default_group.clone(), shards);
    let cluster = ClusterManager::new(config.cluster.default_group.clone()).with_group(Arc::new(group));
    let cache = MetadataQueryCache::new(ClusterDispatch::new(), config.cache_config());

    MetadataService::new(Arc::new(QueryGrammar), Arc::new(cluster), cache)
}

/// Write generated series through the service
async fn seed(
    service: &MetadataService,
    config: &Config,
    options: &DispatchOptions,
) -> Result<u64, Box<dyn std::error::Error>> {
    let generator = GeneratorRegistry::with_defaults().build(&config.generator.name, &config.generator)?;
    let series = generator.generate(config.generator.series);

    let mut accepted = 0;
    for s in series {
        match service.add_series(s, options.clone()).await? {
            AggregateOutcome::Succeeded(result) => accepted += result.accepted,
            other => warn!(outcome = other.label(), "Seed write did not succeed"),
        }
    }

    info!(
        generator = generator.name(),
        accepted,
        shards = config.cluster.shards,
        "Seeded local cluster"
    );
    Ok(accepted)
}

fn print_outcome<T: Serialize>(outcome: &AggregateOutcome<T>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::CheckConfig = cli.command {
        println!("Configuration is valid!");
        println!();
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    debug!(
        "Configuration: default_group={}, shards={}, deadline_ms={}",
        config.cluster.default_group, config.cluster.shards, config.cluster.deadline_ms
    );

    let service = build_service(&config);
    let defaults = config.dispatch_options();
    seed(&service, &config, &defaults).await?;

    let options = |args: &QueryArgs| {
        defaults
            .clone()
            .with_partial_tolerance(defaults.partial_tolerance || args.partial)
    };

    let started = Instant::now();
    match cli.command {
        Commands::Tags(args) => {
            print_outcome(&service.tags(Some(args.params.to_body()), options(&args)).await?)?
        }
        Commands::Keys(args) => {
            print_outcome(&service.keys(Some(args.params.to_body()), options(&args)).await?)?
        }
        Commands::Series(args) => {
            print_outcome(&service.series(Some(args.params.to_body()), options(&args)).await?)?
        }
        Commands::DeleteSeries(args) => print_outcome(
            &service
                .delete_series(Some(args.params.to_body()), options(&args))
                .await?,
        )?,
        Commands::AddSeries { key, tags } => {
            let series = tags
                .into_iter()
                .fold(Series::new(key), |s, (k, v)| s.with_tag(k, v));
            print_outcome(&service.add_series(series, defaults.clone()).await?)?
        }
        Commands::SeriesCount(args) => print_outcome(
            &service
                .series_count(Some(args.params.to_body()), options(&args))
                .await?,
        )?,
        Commands::TagkeyCount(args) => print_outcome(
            &service
                .tagkey_count(Some(args.params.to_body()), options(&args))
                .await?,
        )?,
        Commands::KeySuggest {
            key,
            matching,
            query,
        } => {
            let body = KeySuggestBody {
                body: query.params.to_body(),
                match_options: matching.options(),
                key,
            };
            print_outcome(&service.key_suggest(Some(body), options(&query)).await?)?
        }
        Commands::TagSuggest {
            key,
            value,
            matching,
            query,
        } => {
            let body = TagSuggestBody {
                body: query.params.to_body(),
                match_options: matching.options(),
                key,
                value,
            };
            print_outcome(&service.tag_suggest(Some(body), options(&query)).await?)?
        }
        Commands::TagValueSuggest { key, query } => {
            let body = TagValueSuggestBody {
                body: query.params.to_body(),
                key,
            };
            print_outcome(&service.tag_value_suggest(Some(body), options(&query)).await?)?
        }
        Commands::TagValuesSuggest {
            exclude,
            group_limit,
            query,
        } => {
            let body = TagValuesSuggestBody {
                body: query.params.to_body(),
                exclude,
                group_limit,
            };
            print_outcome(&service.tag_values_suggest(Some(body), options(&query)).await?)?
        }
        Commands::CheckConfig => {}
    }

    info!(
        elapsed = %format_time_nanos(started.elapsed().as_nanos() as u64),
        "Query finished"
    );

    if cli.print_metrics && config.monitoring.metrics_enabled {
        eprint!("{}", metrics::gather_metrics()?);
    }

    Ok(())
}
