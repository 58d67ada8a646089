use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use lotwatch_adapters::TextEncoding;
use lotwatch_query::{query_artifact, Field, Predicate, QueryRequest, ViewFilters};
use lotwatch_storage::load_catalog_or_fallback;
use lotwatch_sync::{local_today, SyncConfig, SyncPipeline, CATALOG_ARTIFACT, CONSOLIDATED_ARTIFACT};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "lotwatch-cli")]
#[command(about = "Consolidate listing snapshots and query market history")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the consolidated table and catalog from every snapshot.
    Consolidate(ConsolidateArgs),
    /// Print lifecycle and daily tables for one manufacturer.
    Query(QueryArgs),
    /// Print the catalog, or the fallback catalog when none has been written.
    Catalog {
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct ConsolidateArgs {
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    /// Skip snapshots observed before this date (YYYY-MM-DD).
    #[arg(long)]
    min_date: Option<NaiveDate>,
    /// utf-16 or utf-8.
    #[arg(long)]
    encoding: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    /// JSON request document; flags below refine it.
    #[arg(long)]
    request: Option<PathBuf>,
    #[arg(long)]
    manufacturer: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long)]
    fuel: Vec<String>,
    #[arg(long)]
    drivetrain: Vec<String>,
    #[arg(long)]
    year_min: Option<i64>,
    #[arg(long)]
    year_max: Option<i64>,
    #[arg(long)]
    mileage_min: Option<i64>,
    #[arg(long)]
    mileage_max: Option<i64>,
    #[arg(long, default_value = "")]
    heading_contains: String,
    #[arg(long, default_value = "")]
    seller_contains: String,
    #[arg(long)]
    view_fuel: Vec<String>,
    #[arg(long)]
    view_drivetrain: Vec<String>,
    #[arg(long)]
    view_year_min: Option<i64>,
    #[arg(long)]
    view_year_max: Option<i64>,
    #[arg(long)]
    view_mileage_min: Option<i64>,
    #[arg(long)]
    view_mileage_max: Option<i64>,
    #[arg(long)]
    price_min: Option<i64>,
    #[arg(long)]
    price_max: Option<i64>,
    #[arg(long)]
    days_min: Option<i64>,
    #[arg(long)]
    days_max: Option<i64>,
    /// Include the statement the remote engine would run.
    #[arg(long)]
    print_sql: bool,
}

impl QueryArgs {
    fn request(&self, today: NaiveDate) -> Result<QueryRequest> {
        let mut request = match &self.request {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<QueryRequest>(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => {
                let Some(manufacturer) = &self.manufacturer else {
                    bail!("--manufacturer or --request is required");
                };
                QueryRequest::new(manufacturer.clone(), today)
            }
        };
        if let Some(manufacturer) = &self.manufacturer {
            request.manufacturer = manufacturer.clone();
        }
        if self.model.is_some() {
            request.model = self.model.clone();
        }
        if let Some(from) = self.from {
            request.start_date = from;
        }
        if let Some(to) = self.to {
            request.end_date = to;
        }
        request.prefilters.extend([
            Predicate::one_of(Field::Fuel, self.fuel.iter().cloned()),
            Predicate::one_of(Field::Drivetrain, self.drivetrain.iter().cloned()),
            Predicate::range(Field::Year, self.year_min, self.year_max),
            Predicate::range(Field::Mileage, self.mileage_min, self.mileage_max),
        ]);
        Ok(request)
    }

    fn view(&self) -> ViewFilters {
        ViewFilters {
            heading_contains: self.heading_contains.clone(),
            seller_contains: self.seller_contains.clone(),
            fuel: self.view_fuel.iter().cloned().collect(),
            drivetrain: self.view_drivetrain.iter().cloned().collect(),
            year_min: self.view_year_min,
            year_max: self.view_year_max,
            price_min: self.price_min,
            price_max: self.price_max,
            mileage_min: self.view_mileage_min,
            mileage_max: self.view_mileage_max,
            dwell_days_min: self.days_min,
            dwell_days_max: self.days_max,
        }
    }
}

fn sync_config(args: ConsolidateArgs) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env();
    if let Some(dir) = args.snapshot_dir {
        config.snapshot_dir = dir;
    }
    if let Some(dir) = args.artifacts_dir {
        config.artifacts_dir = dir;
    }
    if args.min_date.is_some() {
        config.min_date = args.min_date;
    }
    if let Some(encoding) = args.encoding {
        config.format.encoding =
            TextEncoding::parse(&encoding).with_context(|| format!("unsupported encoding {encoding}"))?;
    }
    if let Some(workers) = args.workers {
        config.parse_workers = workers;
    }
    Ok(config)
}

fn artifacts_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| SyncConfig::from_env().artifacts_dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Consolidate(ConsolidateArgs::default())) {
        Commands::Consolidate(args) => {
            let config = sync_config(args)?;
            let summary = SyncPipeline::new(config).run_once().await?;
            println!(
                "consolidation complete: run_id={} snapshots={} events={} listings={} excluded_files={} report={}",
                summary.run_id,
                summary.stats.snapshots,
                summary.event_rows,
                summary.listings,
                summary.diagnostics.len(),
                summary.report_path
            );
            for diagnostic in &summary.diagnostics {
                println!("  excluded {}: {}", diagnostic.path.display(), diagnostic.message);
            }
        }
        Commands::Query(args) => {
            let today = local_today();
            let request = args.request(today)?;
            let view = args.view();
            let dir = artifacts_dir(args.artifacts_dir.clone());
            let catalog = load_catalog_or_fallback(&dir.join(CATALOG_ARTIFACT), today);
            if let Some(model) = request.unknown_model(&catalog) {
                warn!(manufacturer = %request.manufacturer, model, "model not in catalog; expect an empty result");
            }
            let path = dir.join(CONSOLIDATED_ARTIFACT);
            let display = tokio::task::spawn_blocking({
                let request = request.clone();
                move || query_artifact(&path, &request, &view)
            })
            .await
            .context("joining query task")??;
            let matching = display.matching_count;
            info!(matching, "query complete");

            let mut out = serde_json::Map::new();
            if args.print_sql {
                out.insert(
                    "sql".to_string(),
                    serde_json::Value::String(request.to_sql(QueryRequest::DEFAULT_TABLE)?),
                );
            }
            out.insert(
                "display".to_string(),
                serde_json::to_value(&display).context("serializing display tables")?,
            );
            println!("{}", serde_json::to_string_pretty(&out).context("serializing query output")?);
        }
        Commands::Catalog { artifacts_dir: dir } => {
            let path = artifacts_dir(dir).join(CATALOG_ARTIFACT);
            let catalog = load_catalog_or_fallback(&path, local_today());
            println!("{}", serde_json::to_string_pretty(&catalog).context("serializing catalog")?);
        }
    }

    Ok(())
}
