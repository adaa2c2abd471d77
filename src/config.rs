//! Engine configuration
//!
//! Everything serializable lives here. The one runtime control that is not
//! a config field is the global abort signal, which is a cancellation
//! token owned by the engine.

use crate::error::{DownloadError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the download engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for downloads
    pub writepath: PathBuf,

    /// Recursively queue dependency artifacts before downloading
    pub fetch_depends: bool,

    /// Verify server certificates on TLS mirrors (per-job default)
    pub validate_tls: bool,

    /// Upper bound on concurrent transfers per job
    pub max_parallel: u32,

    /// Base URL of the metadata search service
    pub search_url: String,

    /// HTTP client configuration
    pub http: HttpConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            writepath: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("armory"),
            fetch_depends: true,
            validate_tls: true,
            max_parallel: 4,
            search_url: "https://springfiles.springrts.com/json.php".to_string(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            user_agent: format!("armory-dl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download root
    pub fn writepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.writepath = path.into();
        self
    }

    /// Enable or disable dependency expansion
    pub fn fetch_depends(mut self, yes: bool) -> Self {
        self.fetch_depends = yes;
        self
    }

    /// Enable or disable TLS peer verification
    pub fn validate_tls(mut self, yes: bool) -> Self {
        self.validate_tls = yes;
        self
    }

    /// Set the per-job transfer bound
    pub fn max_parallel(mut self, max: u32) -> Self {
        self.max_parallel = max;
        self
    }

    /// Set the metadata search endpoint
    pub fn search_url(mut self, url: impl Into<String>) -> Self {
        self.search_url = url.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(DownloadError::config("max_parallel", "Must be at least 1"));
        }
        if self.search_url.is_empty() {
            return Err(DownloadError::config("search_url", "Must not be empty"));
        }
        if self.writepath.as_os_str().is_empty() {
            return Err(DownloadError::config("writepath", "Must not be empty"));
        }
        Ok(())
    }
}
