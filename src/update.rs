use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::cancel::{self, CancelToken, CancellableReader, Cancelled};
use crate::config::LauncherConfig;
use crate::http::{self, FetchError};
use crate::progress::Spinner;

const BINARY_NAME: &str = "serverless";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Platform {os} - {arch} is not supported.")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("installer download failed: {0}")]
    DownloadFailed(#[source] FetchError),
    #[error("installer download failed: building HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("installer update interrupted")]
    Interrupted(#[from] Cancelled),
    #[error("locating executable: {0}")]
    Locate(#[source] std::io::Error),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Map Rust's OS/arch names onto the published `<os>-<arch>` build names.
///
/// amd64 and arm64 on linux, darwin and windows, except windows-arm64.
pub fn platform(os: &str, arch: &str) -> Result<(&'static str, &'static str), UpdateError> {
    let unsupported = || UpdateError::UnsupportedPlatform {
        os: os.to_string(),
        arch: arch.to_string(),
    };
    let arch_name = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        _ => return Err(unsupported()),
    };
    let os_name = match os {
        "linux" => "linux",
        "macos" => "darwin",
        "windows" => "windows",
        _ => return Err(unsupported()),
    };
    if os_name == "windows" && arch_name == "arm64" {
        return Err(unsupported());
    }
    Ok((os_name, arch_name))
}

pub fn binary_url(base_url: &str, os: &str, arch: &str) -> Result<String, UpdateError> {
    let (os, arch) = platform(os, arch)?;
    Ok(format!("{base_url}/installer-builds/{BINARY_NAME}-{os}-{arch}"))
}

/// Replace the running launcher with the latest published build.
pub fn self_update(config: &LauncherConfig, token: &CancelToken) -> Result<(), UpdateError> {
    let url = binary_url(
        &config.install_base_url,
        std::env::consts::OS,
        std::env::consts::ARCH,
    )?;
    let exe = std::env::current_exe()
        .and_then(|p| p.canonicalize())
        .map_err(UpdateError::Locate)?;

    let mut spinner = Spinner::start("Updating installer", !config.ci);
    replace_executable(config, &url, &exe, token)?;
    spinner.stop();

    if config.ci {
        eprintln!("Installer update complete");
    }
    Ok(())
}

/// Download `url` next to `exe` and swap it in.
///
/// Order: write `<exe>.new`, drop a stale `<exe>.old`, move `exe` to
/// `<exe>.old`, move `<exe>.new` to `exe`. `exe` always names a complete
/// binary except between the two same-directory renames. An interrupt is
/// honoured only while downloading, never once the renames start.
pub fn replace_executable(
    config: &LauncherConfig,
    url: &str,
    exe: &Path,
    token: &CancelToken,
) -> Result<(), UpdateError> {
    let new_path = sibling(exe, "new");
    let old_path = sibling(exe, "old");

    let client = http::client(Some(config.binary_timeout)).map_err(UpdateError::Client)?;
    debug!(%url, path = %new_path.display(), "downloading installer");
    let request_url = url.to_string();
    let response = cancel::run_cancellable(token, move || http::get(&client, &request_url))?
        .map_err(UpdateError::DownloadFailed)?;

    let mut body = CancellableReader::spawn(response, token.clone());
    let written = (|| -> std::io::Result<()> {
        let mut out = create_executable(&new_path)?;
        std::io::copy(&mut body, &mut out)?;
        out.flush()?;
        out.sync_all()
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&new_path);
        token.check()?;
        return Err(io_err("writing", &new_path)(e));
    }

    if old_path.exists() {
        std::fs::remove_file(&old_path).map_err(io_err("removing", &old_path))?;
    }
    std::fs::rename(exe, &old_path).map_err(io_err("renaming", exe))?;
    std::fs::rename(&new_path, exe).map_err(io_err("renaming", &new_path))?;

    debug!(path = %exe.display(), "installer replaced");
    Ok(())
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> UpdateError {
    let path = path.to_path_buf();
    move |source| UpdateError::Io {
        action,
        path,
        source,
    }
}

fn sibling(exe: &Path, suffix: &str) -> PathBuf {
    let mut name = exe.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn create_executable(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o755);
    }
    options.open(path)
}
