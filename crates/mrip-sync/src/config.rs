use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mrip_adapters::DateFilter;
use mrip_core::{SchemaDefinition, SchemaRegistry, TagKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub reports_config: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub download_workers: usize,
    pub lookback_days: Option<i64>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub natural_key_dedup: bool,
    pub max_in_memory_entry_bytes: u64,
    pub stale_lock_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };
        Self {
            data_dir: lookup("MRIP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            reports_config: lookup("MRIP_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports.yaml")),
            user_agent: lookup("MRIP_USER_AGENT").unwrap_or_else(|| "mrip/0.1".to_string()),
            http_timeout_secs: lookup("MRIP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            download_workers: lookup("MRIP_DOWNLOAD_WORKERS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
            lookback_days: lookup("MRIP_LOOKBACK_DAYS").and_then(|v| v.parse().ok()),
            scheduler_enabled: flag("MRIP_SCHEDULER_ENABLED"),
            sync_cron: lookup("MRIP_SYNC_CRON").unwrap_or_else(|| "0 */30 * * * *".to_string()),
            natural_key_dedup: flag("MRIP_NATURAL_KEY_DEDUP"),
            max_in_memory_entry_bytes: lookup("MRIP_MAX_IN_MEMORY_ENTRY_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(64 * 1024 * 1024),
            stale_lock_secs: lookup("MRIP_STALE_LOCK_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(6 * 60 * 60),
        }
    }

    /// Defaults rooted at `data_dir`, ignoring the environment.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::from_lookup(|_| None);
        config.data_dir = data_dir.into();
        config
    }

    pub fn archives_dir(&self, family: &str) -> PathBuf {
        self.data_dir.join("archives").join(family)
    }

    pub fn dataset_dir(&self, family: &str) -> PathBuf {
        self.data_dir.join("datasets").join(family)
    }

    pub fn tracker_path(&self, family: &str) -> PathBuf {
        self.data_dir.join("trackers").join(format!("{family}.sqlite"))
    }

    pub fn reports_root(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("mrip.lock")
    }
}

/// One report family: where it is listed and which tagged dataset it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub id: String,
    pub listing_url: String,
    pub category: String,
    pub subtype: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub date_filter: Option<DateFilter>,
    #[serde(default = "default_archive_extension")]
    pub archive_extension: String,
    #[serde(default = "default_member_extension")]
    pub member_extension: String,
}

fn default_enabled() -> bool {
    true
}

fn default_archive_extension() -> String {
    ".zip".to_string()
}

fn default_member_extension() -> String {
    ".csv".to_string()
}

impl FamilyConfig {
    pub fn tag(&self) -> TagKey {
        TagKey::new(self.category.clone(), self.subtype.clone())
    }

    /// The configured filter, with `lookback_override` replacing (or creating) its window.
    pub fn effective_date_filter(&self, lookback_override: Option<i64>) -> Option<DateFilter> {
        match (self.date_filter.clone(), lookback_override) {
            (Some(mut filter), Some(days)) => {
                filter.lookback_days = days;
                Some(filter)
            }
            (Some(filter), None) => Some(filter),
            (None, Some(days)) => Some(DateFilter::new(days)),
            (None, None) => None,
        }
    }
}

/// Contents of `reports.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportsFile {
    pub families: Vec<FamilyConfig>,
    #[serde(default)]
    pub schemas: Vec<SchemaDefinition>,
}

impl ReportsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: ReportsFile = serde_yaml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for family in &file.families {
            anyhow::ensure!(
                seen.insert(family.id.as_str()),
                "duplicate report family id {}",
                family.id
            );
        }
        Ok(file)
    }

    /// Falls back to the built-in families when the file does not exist.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "no reports config, using built-in families");
            Ok(Self::builtin())
        }
    }

    pub fn builtin() -> Self {
        Self {
            families: vec![
                FamilyConfig {
                    id: "trading-price".to_string(),
                    listing_url: "https://nemweb.com.au/Reports/Current/TradingIS_Reports/"
                        .to_string(),
                    category: "TRADING".to_string(),
                    subtype: "PRICE".to_string(),
                    enabled: true,
                    date_filter: None,
                    archive_extension: default_archive_extension(),
                    member_extension: default_member_extension(),
                },
                FamilyConfig {
                    id: "dispatch-scada".to_string(),
                    listing_url: "https://nemweb.com.au/Reports/Current/Dispatch_SCADA/"
                        .to_string(),
                    category: "DISPATCH".to_string(),
                    subtype: "UNIT_SCADA".to_string(),
                    enabled: true,
                    date_filter: None,
                    archive_extension: default_archive_extension(),
                    member_extension: default_member_extension(),
                },
                FamilyConfig {
                    id: "mtpasa-duid-availability".to_string(),
                    listing_url: "https://nemweb.com.au/Reports/Current/MTPASA_DUIDAvailability/"
                        .to_string(),
                    category: "MTPASA".to_string(),
                    subtype: "DUIDAVAILABILITY".to_string(),
                    enabled: true,
                    date_filter: Some(DateFilter::new(180)),
                    archive_extension: default_archive_extension(),
                    member_extension: default_member_extension(),
                },
            ],
            schemas: Vec::new(),
        }
    }

    /// Built-in registry plus any schemas declared in the file.
    pub fn registry(&self) -> SchemaRegistry {
        let mut registry = SchemaRegistry::builtin();
        for schema in &self.schemas {
            registry.register(schema.clone());
        }
        registry
    }

    pub fn family(&self, id: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|f| f.id == id)
    }
}
