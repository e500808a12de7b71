use std::path::PathBuf;

use crate::{
    fetch::{FetchConfig, FetchError, Fetcher, HttpTransport},
    storage::RecordStore,
    sync::{SyncOptions, SyncOrchestrator},
};

pub const DEFAULT_DATA_ROOT: &str = "data";

/// Everything one invocation needs: where records live, how to download, what to download.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_root: PathBuf,
    pub fetch: FetchConfig,
    pub sync: SyncOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            fetch: FetchConfig::default(),
            sync: SyncOptions::default(),
        }
    }
}

impl Config {
    pub fn record_store(&self) -> RecordStore {
        RecordStore::new(&self.data_root)
    }

    pub fn orchestrator(&self) -> Result<SyncOrchestrator<HttpTransport>, FetchError> {
        let fetcher = Fetcher::from_config(self.fetch.clone())?;
        Ok(SyncOrchestrator::new(fetcher, self.record_store()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchMode, DEFAULT_EXPORT_URL};
    use crate::revision_parser::TextMode;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.data_root, PathBuf::from("data"));
        assert_eq!(config.fetch.export_url, DEFAULT_EXPORT_URL);
        assert_eq!(config.fetch.retry.max_attempts, 5);
        assert_eq!(config.sync.mode, FetchMode::FullHistory);
        assert_eq!(config.sync.text, TextMode::LengthOnly);
        assert!(!config.sync.full_refresh);
        assert_eq!(config.record_store().root(), config.data_root.as_path());
    }
}
