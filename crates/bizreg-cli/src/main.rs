use anyhow::Result;
use bizreg_graph::LayoutConfig;
use bizreg_sync::{CrawlConfig, CrawlPipeline};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bizreg-cli")]
#[command(about = "FirstStop business registry crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stage and write a run summary.
    Crawl,
    /// Fetch the company listing into company_info.csv.
    Companies,
    /// Fetch one detail page per listed company into owner_agent.csv.
    Details {
        /// Re-fetch companies that already have a stored detail row.
        #[arg(long)]
        refresh: bool,
    },
    /// Join listings and details into company_info_crawled.csv.
    Merge,
    /// Plot the agent and owner graphs to graph_plot.svg.
    Graph {
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        iterations: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = CrawlConfig::from_env()?;
    debug!(?config, "loaded configuration");
    let pipeline = CrawlPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Crawl) {
        Commands::Crawl => {
            let summary = pipeline.run_once().await?;
            println!(
                "crawl complete: run_id={} listings={} details={} merged={} dropped={} reports={}",
                summary.run_id,
                summary.listing.listings,
                summary.details.fetched,
                summary.merge.merged,
                summary.merge.listings_without_detail + summary.merge.details_without_listing,
                summary.reports_dir.display()
            );
        }
        Commands::Companies => {
            let summary = pipeline.crawl_listing(&pipeline.context()).await?;
            println!(
                "companies: {} listed ({} new, {} updated, {} removed) -> {}",
                summary.listings,
                summary.inserted,
                summary.updated,
                summary.removed,
                pipeline.config().listing_path().display()
            );
        }
        Commands::Details { refresh } => {
            let summary = pipeline.crawl_details(&pipeline.context(), refresh).await?;
            println!(
                "details: {} fetched, {} skipped, {} without agent, {} without owner -> {}",
                summary.fetched,
                summary.skipped,
                summary.agents_absent,
                summary.owners_absent,
                pipeline.config().detail_path().display()
            );
        }
        Commands::Merge => {
            let summary = pipeline.merge()?;
            println!(
                "merge: {} records ({} listings without detail, {} details without listing) -> {}",
                summary.merged,
                summary.listings_without_detail,
                summary.details_without_listing,
                pipeline.config().merged_path().display()
            );
        }
        Commands::Graph { seed, iterations } => {
            let defaults = pipeline.config().layout;
            let layout = LayoutConfig {
                seed: seed.unwrap_or(defaults.seed),
                iterations: iterations.unwrap_or(defaults.iterations),
            };
            let summary = pipeline.render_graph(layout)?;
            println!(
                "graph: agent {} edges, owner {} edges -> {}",
                summary.agent.edges,
                summary.owner.edges,
                summary.output.display()
            );
        }
    }

    Ok(())
}
