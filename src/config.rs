use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

/// How the service sources partition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    Remote,
    Hybrid,
}

impl StorageMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "remote" | "azure" => Some(Self::Remote),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    pub fn uses_local(self) -> bool {
        matches!(self, Self::Local | Self::Hybrid)
    }

    pub fn uses_remote(self) -> bool {
        matches!(self, Self::Remote | Self::Hybrid)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub local_data_root: PathBuf,
    pub tmp_path: PathBuf,
    pub storage_mode: StorageMode,
    pub azure_account: Option<String>,
    pub azure_container: Option<String>,
    pub azure_sas_token: Option<String>,
    pub azure_access_key: Option<String>,
    pub remote_prefix: String,
    pub max_workers: usize,
    pub local_listing_ttl_seconds: u64,
    pub remote_listing_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub cache_max_bytes: u64,
    pub cache_default_ttl_seconds: u64,
    pub cache_min_duration_seconds: u64,
    pub cache_min_sensor_count_bypass: usize,
    pub frequency_max_age_hours: u64,
    pub enable_smart_aggregation: bool,
    pub max_datapoints_default: usize,
    pub max_absolute_datapoints: usize,
    pub max_query_duration_hours: f64,
    pub raw_tier_max_hours: f64,
    pub aggregated_tier_max_hours: f64,
    pub rebuild_minute_chunk_hours: i64,
    pub rebuild_daily_chunk_days: i64,
    pub rebuild_min_success_rate: f64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let storage_mode_raw = env_string("SQS_STORAGE_MODE", "local");
        let storage_mode = StorageMode::parse(&storage_mode_raw)
            .with_context(|| format!("SQS_STORAGE_MODE has unrecognized value '{storage_mode_raw}'"))?;

        let data_root_value = env_optional_string("SQS_LOCAL_DATA_ROOT")
            .unwrap_or_else(|| "/var/lib/sensor-query-service/lake".to_string());
        let local_data_root = PathBuf::from(data_root_value);
        if local_data_root.as_os_str().is_empty() {
            anyhow::bail!("SQS_LOCAL_DATA_ROOT resolved to an empty path");
        }

        let tmp_default = local_data_root.join(".tmp");
        let tmp_path = env_path("SQS_TMP_PATH", &tmp_default.to_string_lossy())?;

        let azure_account = env_optional_string("SQS_AZURE_STORAGE_ACCOUNT");
        let azure_container = env_optional_string("SQS_AZURE_CONTAINER");
        let azure_sas_token = env_optional_string("SQS_AZURE_SAS_TOKEN");
        let azure_access_key = env_optional_string("SQS_AZURE_ACCESS_KEY");
        let remote_prefix = env_string("SQS_REMOTE_PREFIX", "");

        if storage_mode.uses_remote() && azure_account.is_none() {
            anyhow::bail!(
                "SQS_STORAGE_MODE={storage_mode_raw} requires SQS_AZURE_STORAGE_ACCOUNT to be set"
            );
        }

        let max_workers = env_u64("SQS_MAX_WORKERS", 8).clamp(1, 256) as usize;
        let local_listing_ttl_seconds = env_u64("SQS_LOCAL_LISTING_TTL_SECONDS", 60);
        let remote_listing_ttl_seconds = env_u64("SQS_REMOTE_LISTING_TTL_SECONDS", 300);

        let cache_max_entries = env_u64("SQS_CACHE_MAX_ENTRIES", 500).clamp(1, 1_000_000) as usize;
        let cache_max_bytes = env_u64("SQS_CACHE_MAX_BYTES", 256 * 1024 * 1024);
        let cache_default_ttl_seconds = env_u64("SQS_CACHE_DEFAULT_TTL_SECONDS", 300);
        let cache_min_duration_seconds = env_u64("SQS_CACHE_MIN_DURATION_SECONDS", 360);
        let cache_min_sensor_count_bypass =
            env_u64("SQS_CACHE_MIN_SENSOR_COUNT_BYPASS", 5).clamp(1, 10_000) as usize;
        let frequency_max_age_hours = env_u64("SQS_FREQUENCY_MAX_AGE_HOURS", 24);
        let enable_smart_aggregation = env_bool("SQS_ENABLE_SMART_AGGREGATION", true);

        let max_datapoints_default =
            env_u64("SQS_MAX_DATAPOINTS_DEFAULT", 10_000).clamp(1, 1_000_000) as usize;
        let max_absolute_datapoints =
            env_u64("SQS_MAX_ABSOLUTE_DATAPOINTS", 50_000).clamp(max_datapoints_default as u64, 5_000_000)
                as usize;
        let max_query_duration_hours = env_string("SQS_MAX_QUERY_DURATION_HOURS", "8760")
            .parse::<f64>()
            .unwrap_or(8760.0);
        let raw_tier_max_hours = env_string("SQS_RAW_TIER_MAX_HOURS", "24")
            .parse::<f64>()
            .unwrap_or(24.0);
        let aggregated_tier_max_hours = env_string("SQS_AGGREGATED_TIER_MAX_HOURS", "168")
            .parse::<f64>()
            .unwrap_or(168.0);

        let rebuild_minute_chunk_hours = env_u64("SQS_REBUILD_MINUTE_CHUNK_HOURS", 24) as i64;
        let rebuild_daily_chunk_days = env_u64("SQS_REBUILD_DAILY_CHUNK_DAYS", 7) as i64;
        let rebuild_min_success_rate = env_string("SQS_REBUILD_MIN_SUCCESS_RATE", "0.8")
            .parse::<f64>()
            .unwrap_or(0.8);

        let mut config = Self {
            local_data_root,
            tmp_path,
            storage_mode,
            azure_account,
            azure_container,
            azure_sas_token,
            azure_access_key,
            remote_prefix,
            max_workers,
            local_listing_ttl_seconds,
            remote_listing_ttl_seconds,
            cache_max_entries,
            cache_max_bytes,
            cache_default_ttl_seconds,
            cache_min_duration_seconds,
            cache_min_sensor_count_bypass,
            frequency_max_age_hours,
            enable_smart_aggregation,
            max_datapoints_default,
            max_absolute_datapoints,
            max_query_duration_hours,
            raw_tier_max_hours,
            aggregated_tier_max_hours,
            rebuild_minute_chunk_hours,
            rebuild_daily_chunk_days,
            rebuild_min_success_rate,
        };

        config.validate_security_paths()?;
        Ok(config)
    }

    fn validate_security_paths(&mut self) -> Result<()> {
        self.local_data_root =
            validate_and_canonicalize_path(self.local_data_root.clone(), None, "SQS_LOCAL_DATA_ROOT")?;
        self.tmp_path = validate_and_canonicalize_path(
            self.tmp_path.clone(),
            Some(&self.local_data_root),
            "SQS_TMP_PATH",
        )?;
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

fn validate_and_canonicalize_path(path: PathBuf, base: Option<&Path>, label: &str) -> Result<PathBuf> {
    if !path.is_absolute() {
        anyhow::bail!("{label} must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("{label} must not contain '..' segments");
        }
    }
    let canonical = canonicalize_with_existing_parent(&path)
        .with_context(|| format!("failed to canonicalize {label} ({})", path.display()))?;
    if let Some(base) = base {
        let base = canonicalize_with_existing_parent(base)
            .with_context(|| format!("failed to canonicalize base for {label}"))?;
        if !canonical.starts_with(&base) {
            anyhow::bail!("{label} must reside under {}", base.display());
        }
    }
    Ok(canonical)
}

fn canonicalize_with_existing_parent(path: &Path) -> Result<PathBuf> {
    let mut existing = None;
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            existing = Some(ancestor);
            break;
        }
    }
    let Some(existing) = existing else {
        anyhow::bail!("no existing ancestor found for path {}", path.display());
    };
    let base = existing
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", existing.display()))?;
    let suffix = path.strip_prefix(existing).unwrap_or(Path::new(""));
    Ok(base.join(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_or_parent_paths() {
        let err = validate_and_canonicalize_path(PathBuf::from("relative/path"), None, "TEST");
        assert!(err.is_err());

        let err = validate_and_canonicalize_path(PathBuf::from("/tmp/../etc"), None, "TEST");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_paths_outside_base() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base = temp.path().join("base");
        let other = temp.path().join("other");
        std::fs::create_dir_all(&base)?;
        std::fs::create_dir_all(&other)?;

        let err = validate_and_canonicalize_path(other.clone(), Some(&base), "TEST");
        assert!(err.is_err());
        Ok(())
    }

    #[test]
    fn storage_mode_requires_azure_account_in_remote_or_hybrid() {
        assert_eq!(StorageMode::parse("local"), Some(StorageMode::Local));
        assert_eq!(StorageMode::parse("hybrid"), Some(StorageMode::Hybrid));
        assert_eq!(StorageMode::parse("nonsense"), None);
        assert!(StorageMode::Remote.uses_remote());
        assert!(!StorageMode::Local.uses_remote());
        assert!(StorageMode::Hybrid.uses_local());
        assert!(StorageMode::Hybrid.uses_remote());
    }

    #[test]
    fn env_bool_accepts_common_spellings_and_falls_back_on_garbage() {
        std::env::set_var("SQS_TEST_BOOL_ON", "yes");
        std::env::set_var("SQS_TEST_BOOL_OFF", "0");
        std::env::set_var("SQS_TEST_BOOL_GARBAGE", "maybe");
        assert!(env_bool("SQS_TEST_BOOL_ON", false));
        assert!(!env_bool("SQS_TEST_BOOL_OFF", true));
        assert!(env_bool("SQS_TEST_BOOL_GARBAGE", true));
        assert!(!env_bool("SQS_TEST_BOOL_UNSET", false));
        std::env::remove_var("SQS_TEST_BOOL_ON");
        std::env::remove_var("SQS_TEST_BOOL_OFF");
        std::env::remove_var("SQS_TEST_BOOL_GARBAGE");
    }
}
