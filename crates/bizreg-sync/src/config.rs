use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bizreg_adapters::{DetailUrlTemplate, SearchQuery, DEFAULT_DETAIL_URL_TEMPLATE, DEFAULT_SEARCH_URL};
use bizreg_graph::LayoutConfig;
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "bizreg.yaml";
pub const LISTING_FILE: &str = "company_info.csv";
pub const DETAIL_FILE: &str = "owner_agent.csv";
pub const MERGED_FILE: &str = "company_info_crawled.csv";
pub const GRAPH_FILE: &str = "graph_plot.svg";

/// Optional overrides read from `bizreg.yaml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub search_url: Option<String>,
    pub detail_url_template: Option<String>,
    pub search_value: Option<String>,
    pub starts_with: Option<bool>,
    pub active_only: Option<bool>,
}

impl RegistryConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_concurrency: usize,
    /// Unset means no pacing beyond the concurrency limits.
    pub max_requests_per_sec: Option<f64>,
    pub search_url: String,
    pub detail_url_template: String,
    pub query: SearchQuery,
    pub layout: LayoutConfig,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::rooted_at(PathBuf::from("."))
    }
}

impl CrawlConfig {
    /// Defaults with every output placed under `data_dir`.
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            artifacts_dir: data_dir.join("artifacts"),
            reports_dir: data_dir.join("reports"),
            data_dir,
            user_agent: "bizreg-bot/0.1".to_string(),
            http_timeout_secs: 20,
            detail_concurrency: 4,
            max_requests_per_sec: None,
            search_url: DEFAULT_SEARCH_URL.to_string(),
            detail_url_template: DEFAULT_DETAIL_URL_TEMPLATE.to_string(),
            query: SearchQuery::default(),
            layout: LayoutConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Layering: defaults, then the YAML file, then `BIZREG_*` variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("BIZREG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::rooted_at(data_dir);

        let file = match lookup("BIZREG_CONFIG") {
            Some(path) => Some(PathBuf::from(path)),
            None => Some(config.data_dir.join(CONFIG_FILE_NAME)).filter(|p| p.is_file()),
        };
        if let Some(path) = file {
            config.apply_registry(RegistryConfig::load(&path)?);
        }

        if let Some(dir) = lookup("BIZREG_ARTIFACTS_DIR") {
            config.artifacts_dir = PathBuf::from(dir);
        }
        if let Some(agent) = lookup("BIZREG_USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(prefix) = lookup("BIZREG_SEARCH_PREFIX") {
            config.query.search_value = prefix;
        }
        config.http_timeout_secs = lookup("BIZREG_HTTP_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.http_timeout_secs);
        config.detail_concurrency = lookup("BIZREG_DETAIL_CONCURRENCY")
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(config.detail_concurrency);
        config.max_requests_per_sec = lookup("BIZREG_MAX_REQUESTS_PER_SEC")
            .and_then(|v| v.parse().ok())
            .filter(|&rate: &f64| rate > 0.0)
            .or(config.max_requests_per_sec);
        config.layout.seed = lookup("BIZREG_LAYOUT_SEED")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.layout.seed);
        config.layout.iterations = lookup("BIZREG_LAYOUT_ITERATIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.layout.iterations);
        Ok(config)
    }

    pub fn apply_registry(&mut self, registry: RegistryConfig) {
        if let Some(url) = registry.search_url {
            self.search_url = url;
        }
        if let Some(template) = registry.detail_url_template {
            self.detail_url_template = template;
        }
        if let Some(value) = registry.search_value {
            self.query.search_value = value;
        }
        if let Some(flag) = registry.starts_with {
            self.query.starts_with = flag;
        }
        if let Some(flag) = registry.active_only {
            self.query.active_only = flag;
        }
    }

    pub fn detail_template(&self) -> DetailUrlTemplate {
        DetailUrlTemplate::new(self.detail_url_template.clone())
    }

    pub fn listing_path(&self) -> PathBuf {
        self.data_dir.join(LISTING_FILE)
    }

    pub fn detail_path(&self) -> PathBuf {
        self.data_dir.join(DETAIL_FILE)
    }

    pub fn merged_path(&self) -> PathBuf {
        self.data_dir.join(MERGED_FILE)
    }

    pub fn graph_path(&self) -> PathBuf {
        self.data_dir.join(GRAPH_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = CrawlConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.search_url, DEFAULT_SEARCH_URL);
        assert_eq!(config.query, SearchQuery::default());
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.detail_concurrency, 4);
        assert_eq!(config.layout, LayoutConfig { iterations: 16, seed: 42 });
        assert_eq!(config.max_requests_per_sec, None);
        assert_eq!(config.listing_path(), PathBuf::from("./company_info.csv"));
    }

    #[test]
    fn environment_overrides_and_bad_numbers_fall_back() {
        let dir = tempdir().unwrap();
        let config = CrawlConfig::from_lookup(lookup_from(&[
            ("BIZREG_DATA_DIR", dir.path().display().to_string()),
            ("BIZREG_SEARCH_PREFIX", "Y".to_string()),
            ("BIZREG_DETAIL_CONCURRENCY", "0".to_string()),
            ("BIZREG_HTTP_TIMEOUT_SECS", "soon".to_string()),
            ("BIZREG_LAYOUT_SEED", "7".to_string()),
            ("BIZREG_MAX_REQUESTS_PER_SEC", "2.5".to_string()),
        ]))
        .unwrap();

        assert_eq!(config.query.search_value, "Y");
        assert_eq!(config.detail_concurrency, 4);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.layout.seed, 7);
        assert_eq!(config.max_requests_per_sec, Some(2.5));
        assert_eq!(config.artifacts_dir, dir.path().join("artifacts"));
        assert_eq!(config.merged_path(), dir.path().join(MERGED_FILE));
    }

    #[test]
    fn yaml_file_in_data_dir_is_picked_up() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "search_url: http://127.0.0.1:9/search\nsearch_value: Q\nactive_only: false\n",
        )
        .unwrap();

        let config = CrawlConfig::from_lookup(lookup_from(&[(
            "BIZREG_DATA_DIR",
            dir.path().display().to_string(),
        )]))
        .unwrap();
        assert_eq!(config.search_url, "http://127.0.0.1:9/search");
        assert_eq!(config.query.search_value, "Q");
        assert!(config.query.starts_with);
        assert!(!config.query.active_only);
        assert_eq!(config.detail_url_template, DEFAULT_DETAIL_URL_TEMPLATE);
    }

    #[test]
    fn explicit_config_path_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.yaml").display().to_string();
        let err = CrawlConfig::from_lookup(lookup_from(&[("BIZREG_CONFIG", missing)])).unwrap_err();
        assert!(format!("{err:#}").contains("nope.yaml"));
    }
}
