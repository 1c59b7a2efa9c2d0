use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const PROD_INSTALL_URL: &str = "https://install.serverless.com";
pub const CANARY_INSTALL_URL: &str = "https://install.serverless-dev.com";

/// Dependency step run inside `<release>/package` after extraction.
#[derive(Debug, Clone)]
pub struct PostInstall {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for PostInstall {
    fn default() -> Self {
        let program = if cfg!(windows) { "npm.cmd" } else { "npm" };
        PostInstall {
            program: program.to_string(),
            args: ["install", "--no-audit", "--no-fund", "--no-progress"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl std::fmt::Display for PostInstall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub store_dir: PathBuf,          // ~/.serverless (or SLS_INSTALL_DIR)
    pub releases_dir: PathBuf,       // store_dir/releases
    pub binaries_dir: PathBuf,       // store_dir/binaries
    pub metadata_file: PathBuf,      // binaries_dir/metadata.json
    pub versions_cache_file: PathBuf, // binaries_dir/versions.json
    pub install_base_url: String,
    pub canary_base_url: String,
    pub post_install: PostInstall,
    pub ci: bool,           // CI set and not "0"
    pub force_update: bool, // SERVERLESS_FRAMEWORK_FORCE_UPDATE set
    pub cache_ttl: Duration,
    pub archive_timeout: Duration,
    pub binary_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDir,
    #[error("creating {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl LauncherConfig {
    /// Config rooted at `store_dir` with production endpoints and defaults.
    pub fn with_store_dir(store_dir: PathBuf) -> Self {
        let binaries_dir = store_dir.join("binaries");
        LauncherConfig {
            releases_dir: store_dir.join("releases"),
            metadata_file: binaries_dir.join("metadata.json"),
            versions_cache_file: binaries_dir.join("versions.json"),
            binaries_dir,
            store_dir,
            install_base_url: PROD_INSTALL_URL.to_string(),
            canary_base_url: CANARY_INSTALL_URL.to_string(),
            post_install: PostInstall::default(),
            ci: false,
            force_update: false,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            archive_timeout: Duration::from_secs(5 * 60),
            binary_timeout: Duration::from_secs(2 * 60),
        }
    }

    pub fn versions_url(&self) -> String {
        format!("{}/versions.json", self.install_base_url)
    }

    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.releases_dir.join(version)
    }

    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.binaries_dir).map_err(|source| ConfigError::CreateDir {
            path: self.binaries_dir.clone(),
            source,
        })
    }
}

pub fn is_ci_environment() -> bool {
    std::env::var_os("CI").is_some_and(|v| v != "0")
}

pub fn launcher_config() -> Result<LauncherConfig, ConfigError> {
    let store_dir = if let Ok(v) = std::env::var("SLS_INSTALL_DIR") {
        PathBuf::from(v)
    } else {
        dirs::home_dir()
            .ok_or(ConfigError::NoHomeDir)?
            .join(".serverless")
    };

    let mut config = LauncherConfig::with_store_dir(store_dir);

    if let Ok(url) = std::env::var("SLS_INSTALL_BASE_URL") {
        config.install_base_url = url.trim_end_matches('/').to_string();
    }
    if let Ok(url) = std::env::var("SLS_CANARY_BASE_URL") {
        config.canary_base_url = url.trim_end_matches('/').to_string();
    }

    config.ci = is_ci_environment();
    config.force_update = std::env::var_os("SERVERLESS_FRAMEWORK_FORCE_UPDATE").is_some();

    Ok(config)
}
