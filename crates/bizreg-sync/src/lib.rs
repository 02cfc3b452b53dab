//! Crawl pipeline: listing, details, merge and graph stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bizreg_adapters::{
    parse_detail_page, parse_search_response, AdapterContext, FirstStopClient, RegistryClient,
};
use bizreg_core::{CompanyDetail, CompanyListing, CompanyRecord};
use bizreg_graph::{write_svg, GraphStats, LayoutConfig, Relationship, RelationshipGraph};
use bizreg_storage::{
    ArtifactStore, DetailRow, HttpClientConfig, HttpFetcher, KeyedTable, ListingRow, RateLimit,
    RecordRow, UpsertStats,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod config;
mod merge;

pub use config::{
    CrawlConfig, RegistryConfig, CONFIG_FILE_NAME, DETAIL_FILE, GRAPH_FILE, LISTING_FILE,
    MERGED_FILE,
};
pub use merge::{merge_records, MergeOutcome};

pub const CRATE_NAME: &str = "bizreg-sync";

#[derive(Debug, Clone, Serialize)]
pub struct ListingStageSummary {
    pub listings: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub artifact: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetailStageSummary {
    pub requested: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub artifacts_failed: usize,
    pub agents_absent: usize,
    pub owners_absent: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeStageSummary {
    pub listings: usize,
    pub details: usize,
    pub merged: usize,
    pub listings_without_detail: usize,
    pub details_without_listing: usize,
    pub unparsable_urls: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStageSummary {
    pub agent: GraphStats,
    pub owner: GraphStats,
    pub layout: LayoutConfig,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listing: ListingStageSummary,
    pub details: DetailStageSummary,
    pub merge: MergeStageSummary,
    pub graph: GraphStageSummary,
    pub reports_dir: PathBuf,
}

pub struct CrawlPipeline {
    config: CrawlConfig,
    artifacts: ArtifactStore,
    client: Arc<dyn RegistryClient>,
}

impl CrawlPipeline {
    pub fn new(config: CrawlConfig) -> Result<Self> {
        let http = HttpFetcher::new(http_client_config(&config))?;
        let client = FirstStopClient::new(
            Arc::new(http),
            config.search_url.clone(),
            config.detail_template(),
        );
        Ok(Self::with_client(config, Arc::new(client)))
    }

    pub fn with_client(config: CrawlConfig, client: Arc<dyn RegistryClient>) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            artifacts,
            client,
        }
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    pub fn context(&self) -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
        }
    }

    /// Fetches the search results and replaces `company_info.csv` with them.
    /// Companies missing from the latest search are removed.
    pub async fn crawl_listing(&self, ctx: &AdapterContext) -> Result<ListingStageSummary> {
        let page = self
            .client
            .fetch_listing(ctx, &self.config.query)
            .await
            .context("fetching company listing")?;
        let stored = self
            .artifacts
            .store(page.fetched_at, "search", "json", &page.body)
            .await?;
        let listings = parse_search_response(&page.body)
            .with_context(|| format!("parsing search response from {}", page.url))?;

        let mut table = KeyedTable::<ListingRow>::open(self.config.listing_path())?;
        let stats = table.replace_all(listings.iter().cloned().map(ListingRow::from));
        table.save()?;

        info!(
            run_id = %ctx.run_id,
            listings = listings.len(),
            inserted = stats.inserted,
            updated = stats.updated,
            removed = stats.removed,
            path = %table.path().display(),
            "listing stage complete"
        );
        Ok(ListingStageSummary {
            listings: listings.len(),
            inserted: stats.inserted,
            updated: stats.updated,
            unchanged: stats.unchanged,
            removed: stats.removed,
            artifact: stored.relative_path,
        })
    }

    /// Fetches one detail page per listed company. Pages are fetched
    /// concurrently and written by this task alone once all have returned.
    pub async fn crawl_details(
        &self,
        ctx: &AdapterContext,
        refresh: bool,
    ) -> Result<DetailStageSummary> {
        let listings = KeyedTable::<ListingRow>::open(self.config.listing_path())?;
        let mut table = KeyedTable::<DetailRow>::open(self.config.detail_path())?;
        let template = self.client.detail_template();

        let mut summary = DetailStageSummary {
            requested: listings.len(),
            ..Default::default()
        };
        let pending: Vec<_> = listings
            .rows()
            .map(|row| row.id)
            .filter(|&id| refresh || !table.contains_key(&template.url_for(id)))
            .collect();
        summary.skipped = summary.requested - pending.len();
        debug!(pending = pending.len(), skipped = summary.skipped, "detail stage starting");

        let client = &self.client;
        let results: Vec<_> = stream::iter(pending)
            .map(|id| async move { (id, client.fetch_detail(ctx, id).await) })
            .buffer_unordered(self.config.detail_concurrency.max(1))
            .collect()
            .await;

        let mut upserts = UpsertStats::default();
        for (id, result) in results {
            let page = match result {
                Ok(page) => page,
                Err(err) => {
                    warn!(company_id = %id, error = %err, "detail fetch failed");
                    summary.failed += 1;
                    continue;
                }
            };
            if let Err(err) = self
                .artifacts
                .store(page.fetched_at, "detail", "xml", &page.body)
                .await
            {
                warn!(company_id = %id, error = %format!("{err:#}"), "storing detail artifact failed");
                summary.artifacts_failed += 1;
            }
            let detail = parse_detail_page(id, &page);
            summary.fetched += 1;
            summary.agents_absent += usize::from(!detail.agent.is_found());
            summary.owners_absent += usize::from(!detail.owner.is_found());

            let stats = table.upsert(DetailRow {
                index: 0,
                url: detail.source_url,
                agent: detail.agent,
                owner: detail.owner,
            });
            upserts.inserted += stats.inserted;
            upserts.updated += stats.updated;
        }
        table.save()?;

        info!(
            run_id = %ctx.run_id,
            fetched = summary.fetched,
            skipped = summary.skipped,
            failed = summary.failed,
            artifacts_failed = summary.artifacts_failed,
            inserted = upserts.inserted,
            updated = upserts.updated,
            "detail stage complete"
        );
        if summary.failed > 0 {
            bail!(
                "{} of {} detail page(s) failed after retries; rerun to fetch the rest",
                summary.failed,
                summary.requested - summary.skipped
            );
        }
        if summary.artifacts_failed > 0 {
            bail!(
                "{} detail artifact(s) could not be stored under {}; extracted rows were saved",
                summary.artifacts_failed,
                self.config.artifacts_dir.display()
            );
        }
        Ok(summary)
    }

    /// Rebuilds `company_info_crawled.csv` from the two stored tables.
    pub fn merge(&self) -> Result<MergeStageSummary> {
        let listing_table = KeyedTable::<ListingRow>::open(self.config.listing_path())?;
        let detail_table = KeyedTable::<DetailRow>::open(self.config.detail_path())?;
        let template = self.client.detail_template();

        let listings: Vec<CompanyListing> = listing_table.rows().cloned().map(Into::into).collect();
        let mut unparsable_urls = 0;
        let mut details: Vec<CompanyDetail> = detail_table
            .rows()
            .filter_map(|row| match template.id_from_url(&row.url) {
                Ok(id) => Some(CompanyDetail {
                    id,
                    source_url: row.url.clone(),
                    agent: row.agent.clone(),
                    owner: row.owner.clone(),
                }),
                Err(err) => {
                    warn!(url = %row.url, error = %err, "skipping detail row");
                    unparsable_urls += 1;
                    None
                }
            })
            .collect();
        // Rows stored at the current template URL win over stale URLs for the same id.
        details.sort_by_key(|detail| detail.source_url == template.url_for(detail.id));

        let outcome = merge_records(&listings, &details);
        if !outcome.listings_without_detail.is_empty() || !outcome.details_without_listing.is_empty() {
            debug!(
                listings_without_detail = ?outcome.listings_without_detail,
                details_without_listing = ?outcome.details_without_listing,
                "dropped unmatched ids"
            );
        }

        let mut merged = KeyedTable::<RecordRow>::open(self.config.merged_path())?;
        merged.clear();
        merged.upsert_all(outcome.records.iter().cloned().map(RecordRow::from));
        merged.save()?;

        let summary = MergeStageSummary {
            listings: listings.len(),
            details: details.len(),
            merged: outcome.records.len(),
            listings_without_detail: outcome.listings_without_detail.len(),
            details_without_listing: outcome.details_without_listing.len(),
            unparsable_urls,
        };
        info!(
            merged = summary.merged,
            dropped = summary.listings_without_detail + summary.details_without_listing,
            path = %merged.path().display(),
            "merge complete"
        );
        Ok(summary)
    }

    /// Builds both relationship graphs and writes `graph_plot.svg`.
    pub fn render_graph(&self, layout: LayoutConfig) -> Result<GraphStageSummary> {
        let table = KeyedTable::<RecordRow>::open(self.config.merged_path())?;
        let records: Vec<CompanyRecord> = table.rows().cloned().map(Into::into).collect();
        let graphs = [
            RelationshipGraph::build(Relationship::Agent, &records),
            RelationshipGraph::build(Relationship::Owner, &records),
        ];

        let output = self.config.graph_path();
        write_svg(&output, &graphs, layout)?;
        Ok(GraphStageSummary {
            agent: graphs[0].stats(),
            owner: graphs[1].stats(),
            layout,
            output,
        })
    }

    /// Runs every stage and writes `reports/<run_id>/summary.json`.
    pub async fn run_once(&self) -> Result<CrawlRunSummary> {
        let started_at = Utc::now();
        let ctx = self.context();

        let listing = self.crawl_listing(&ctx).await?;
        let details = self.crawl_details(&ctx, false).await?;
        let merge = self.merge()?;
        let graph = self.render_graph(self.config.layout)?;

        let reports_dir = self.config.reports_dir.join(ctx.run_id.to_string());
        let summary = CrawlRunSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            listing,
            details,
            merge,
            graph,
            reports_dir: reports_dir.clone(),
        };
        write_summary(&reports_dir, &summary).await?;
        Ok(summary)
    }
}

fn http_client_config(config: &CrawlConfig) -> HttpClientConfig {
    let concurrency = config.detail_concurrency.max(1);
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        max_in_flight: concurrency,
        max_in_flight_per_endpoint: concurrency,
        rate_limit: config.max_requests_per_sec.map(|per_second| RateLimit {
            per_second,
            burst: u32::try_from(concurrency).unwrap_or(u32::MAX),
        }),
        ..Default::default()
    }
}

async fn write_summary(reports_dir: &Path, summary: &CrawlRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
