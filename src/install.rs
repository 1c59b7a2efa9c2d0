use std::collections::HashSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::{self, CancelToken, CancellableReader};
use crate::config::LauncherConfig;
use crate::http::{self, FetchError};
use crate::metadata::MetadataStore;
use crate::progress::Spinner;
use crate::resolve::ReleaseRecord;

/// Present only once extraction and post-install both finished.
pub const ENTRY_POINT: &str = "package/dist/sf-core.js";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("download failed: {0}")]
    DownloadFailed(#[source] FetchError),
    #[error("download failed: building HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("extracting archive: {0}")]
    ExtractFailed(String),
    #[error("{command} failed ({status})\ndir: {}\n{output}", dir.display())]
    PostInstallFailed {
        command: String,
        dir: PathBuf,
        status: String,
        output: String,
    },
    #[error("removing incomplete installation at {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("installation interrupted")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Installation {
    pub path: PathBuf,
    /// False when an existing install was reused.
    pub fresh: bool,
}

pub fn is_complete(release_path: &Path) -> bool {
    release_path.join(ENTRY_POINT).is_file()
}

/// Ensure the release in `record` is installed and return its directory.
///
/// Fast path: a complete release directory is returned as-is unless `force`.
/// Otherwise the directory is rebuilt from scratch; on any failure or
/// cancellation it is removed again, so a release directory either holds a
/// finished install or does not exist.
pub fn ensure_installed(
    config: &LauncherConfig,
    record: &ReleaseRecord,
    force: bool,
    token: &CancelToken,
) -> Result<Installation, InstallError> {
    let release_path = config.release_dir(&record.version);
    if !force && is_complete(&release_path) {
        return Ok(Installation {
            path: release_path,
            fresh: false,
        });
    }

    if release_path.exists() {
        debug!(path = %release_path.display(), "removing previous release directory");
        std::fs::remove_dir_all(&release_path).map_err(|source| InstallError::Cleanup {
            path: release_path.clone(),
            source,
        })?;
    }

    let mut guard = CleanupGuard::new(&release_path);
    let mut spinner = Spinner::start("Updating Serverless Framework", !config.ci);

    download_and_extract(config, record, &release_path, token)?;
    run_post_install(config, &release_path, token)?;

    MetadataStore::new(&config.metadata_file).write(&record.version);
    guard.disarm();
    spinner.stop();
    info!(version = %record.version, path = %release_path.display(), "installed release");

    Ok(Installation {
        path: release_path,
        fresh: true,
    })
}

fn download_and_extract(
    config: &LauncherConfig,
    record: &ReleaseRecord,
    release_path: &Path,
    token: &CancelToken,
) -> Result<(), InstallError> {
    let client = http::client(Some(config.archive_timeout)).map_err(InstallError::Client)?;
    debug!(
        url = %record.download_url,
        released = %record.release_date,
        "downloading release archive"
    );
    // Connect and header wait run on a worker so an interrupt is not held
    // up by a stalled server.
    let url = record.download_url.clone();
    let response = cancel::run_cancellable(token, move || http::get(&client, &url))
        .map_err(|_| InstallError::Cancelled)?
        .map_err(InstallError::DownloadFailed)?;

    extract_archive(
        CancellableReader::spawn(response, token.clone()),
        release_path,
        token,
    )
}

/// Unpack a `.tgz` stream into `root`, entry by entry.
///
/// Only directories and regular files are accepted, and every entry must
/// land strictly inside `root`. Cancellation is checked between entries;
/// a [`CancellableReader`] source also stops mid-entry.
pub fn extract_archive<R: Read>(
    reader: R,
    root: &Path,
    token: &CancelToken,
) -> Result<(), InstallError> {
    use flate2::read::GzDecoder;
    use tar::{Archive, EntryType};

    let failed = |what: String, e: std::io::Error| {
        if token.is_cancelled() {
            InstallError::Cancelled
        } else {
            InstallError::ExtractFailed(format!("{what}: {e}"))
        }
    };

    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut seen_dirs: HashSet<PathBuf> = HashSet::new();

    let entries = archive
        .entries()
        .map_err(|e| failed("reading archive".to_string(), e))?;
    for entry in entries {
        if token.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let mut entry = entry.map_err(|e| failed("reading archive entry".to_string(), e))?;
        let name = entry
            .path()
            .map_err(|e| failed("reading entry path".to_string(), e))?
            .into_owned();

        match entry.header().entry_type() {
            EntryType::Directory => {
                let path = join_inside(root, &name)?;
                std::fs::create_dir_all(&path)
                    .map_err(|e| failed(format!("creating directory {}", path.display()), e))?;
                seen_dirs.insert(path);
            }
            EntryType::Regular => {
                let path = join_inside(root, &name)?;
                if let Some(parent) = path.parent() {
                    if !seen_dirs.contains(parent) {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            failed(format!("creating directory {}", parent.display()), e)
                        })?;
                        seen_dirs.insert(parent.to_path_buf());
                    }
                }
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut out = create_file(&path, mode)
                    .map_err(|e| failed(format!("opening file {}", path.display()), e))?;
                std::io::copy(&mut entry, &mut out)
                    .map_err(|e| failed(format!("writing file {}", path.display()), e))?;
            }
            other => {
                return Err(InstallError::ExtractFailed(format!(
                    "unexpected tar entry type {:?} in {}",
                    other,
                    name.display()
                )));
            }
        }
    }
    Ok(())
}

/// `root` joined with the lexically cleaned `name`; errors unless the result
/// is strictly below `root`.
fn join_inside(root: &Path, name: &Path) -> Result<PathBuf, InstallError> {
    let invalid = || InstallError::ExtractFailed(format!("invalid file path {}", name.display()));

    let mut clean: Vec<&std::ffi::OsStr> = Vec::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop().ok_or_else(invalid)?;
            }
            Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }
    if clean.is_empty() {
        return Err(invalid());
    }
    Ok(clean.iter().fold(root.to_path_buf(), |p, c| p.join(c)))
}

fn create_file(path: &Path, mode: u32) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)
}

/// Run the dependency step inside `<release>/package`, capturing combined
/// output. Silent on success; the output travels in the error otherwise.
fn run_post_install(
    config: &LauncherConfig,
    release_path: &Path,
    token: &CancelToken,
) -> Result<(), InstallError> {
    let dir = release_path.join("package");
    let command = config.post_install.to_string();
    let failed = |status: String, output: &[u8]| InstallError::PostInstallFailed {
        command: command.clone(),
        dir: dir.clone(),
        status,
        output: String::from_utf8_lossy(output).into_owned(),
    };

    if token.is_cancelled() {
        return Err(InstallError::Cancelled);
    }

    debug!(%command, dir = %dir.display(), "running post-install");
    let mut child = Command::new(&config.post_install.program)
        .args(&config.post_install.args)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| failed(format!("failed to start: {e}"), &[]))?;

    let output = Arc::new(Mutex::new(Vec::new()));
    let readers: Vec<_> = [
        child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
    ]
    .into_iter()
    .flatten()
    .map(|stream| {
        let output = Arc::clone(&output);
        std::thread::spawn(move || collect_output(stream, &output))
    })
    .collect();

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(Some(status)),
            Ok(None) => {}
            Err(e) => break Err(e),
        }
        if token.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            break Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    // Grandchildren may still hold the pipes open; do not wait for them.
    let status = match status {
        Ok(Some(status)) => Ok(status),
        Ok(None) => return Err(InstallError::Cancelled),
        Err(e) => Err(e),
    };

    for reader in readers {
        let _ = reader.join();
    }
    let output = output.lock().map(|o| o.clone()).unwrap_or_default();

    let status = status.map_err(|e| failed(format!("waiting for process: {e}"), &output))?;

    if status.success() {
        return Ok(());
    }
    if interrupted(&status) {
        return Err(InstallError::Cancelled);
    }
    warn!(%command, %status, "post-install failed");
    Err(failed(describe_status(&status), &output))
}

fn collect_output(mut stream: Box<dyn Read + Send>, output: &Mutex<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut out) = output.lock() {
                    out.extend_from_slice(&buf[..n]);
                }
            }
        }
    }
}

const SIGINT: i32 = 2;
const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

/// Windows STATUS_CONTROL_C_EXIT.
const STATUS_CONTROL_C_EXIT: u32 = 0xC000_013A;

/// The child died from an interrupt-like signal (or Ctrl-C on Windows).
fn interrupted(status: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return matches!(sig, SIGINT | SIGTERM | SIGKILL);
        }
    }
    if cfg!(windows) {
        return status.code().is_some_and(|c| c as u32 == STATUS_CONTROL_C_EXIT);
    }
    false
}

fn describe_status(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("exit code {}", 128 + sig);
        }
    }
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated".to_string(),
    }
}

/// Removes the release directory on drop unless disarmed.
struct CleanupGuard {
    path: PathBuf,
    armed: bool,
}

impl CleanupGuard {
    fn new(path: &Path) -> Self {
        CleanupGuard {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed || !self.path.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove incomplete installation");
            eprintln!(
                "Failed to remove incomplete installation at {}: {}\nPlease run `serverless update` to reinstall.",
                self.path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PostInstall;
    use crate::http::test_servers;
    use chrono::Utc;
    use std::time::Instant;
    use tempfile::tempdir;

    /// Entry in a synthetic archive.
    enum Item<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8], u32),
        /// Raw name, written without tar's own path validation.
        RawFile(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
    }

    fn make_tgz(items: &[Item]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use tar::{Builder, EntryType, Header};

        let enc = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(enc);
        for item in items {
            let mut header = Header::new_gnu();
            match item {
                Item::Dir(name) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, name, std::io::empty()).unwrap();
                }
                Item::File(name, content, mode) => {
                    header.set_size(content.len() as u64);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *content).unwrap();
                }
                Item::RawFile(name, content) => {
                    let raw = &mut header.as_gnu_mut().unwrap().name;
                    raw[..name.len()].copy_from_slice(name.as_bytes());
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                Item::Symlink(name, target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_link_name(target).unwrap();
                    header.set_cksum();
                    builder.append_data(&mut header, name, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn release_tgz() -> Vec<u8> {
        make_tgz(&[
            Item::Dir("package/"),
            Item::Dir("package/dist/"),
            Item::File("package/dist/sf-core.js", b"console.log('hi')", 0o644),
            Item::File("package/bin/run", b"#!/bin/sh\n", 0o755),
            Item::File("package/package.json", b"{}", 0o644),
        ])
    }

    fn config_for(dir: &Path, program: &str, args: &[&str]) -> LauncherConfig {
        let mut config = LauncherConfig::with_store_dir(dir.to_path_buf());
        config.ci = true;
        config.post_install = PostInstall {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        };
        config.ensure_dirs().unwrap();
        config
    }

    fn record(version: &str, url: String) -> ReleaseRecord {
        ReleaseRecord {
            version: version.to_string(),
            release_date: Utc::now(),
            download_url: url,
            latest_version: version.to_string(),
        }
    }

    #[test]
    fn fast_path_reuses_complete_install() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path(), "false", &[]);
        let entry = config.release_dir("4.1.0").join(ENTRY_POINT);
        std::fs::create_dir_all(entry.parent().unwrap()).unwrap();
        std::fs::write(&entry, "").unwrap();

        let rec = record("4.1.0", "http://127.0.0.1:1/archives/x.tgz".to_string());
        let inst = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap();
        assert_eq!(inst.path, config.release_dir("4.1.0"));
        assert!(!inst.fresh);
    }

    #[cfg(unix)]
    #[test]
    fn installs_release_and_records_metadata() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let m = server
            .mock("GET", "/archives/serverless-4.2.0.tgz")
            .with_body(release_tgz())
            .expect(1)
            .create();
        let config = config_for(dir.path(), "true", &[]);
        let rec = record("4.2.0", format!("{}/archives/serverless-4.2.0.tgz", server.url()));

        let inst = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap();
        m.assert();
        assert!(inst.fresh);
        assert!(is_complete(&inst.path));
        assert_eq!(
            std::fs::read(inst.path.join("package/dist/sf-core.js")).unwrap(),
            b"console.log('hi')"
        );

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(inst.path.join("package/bin/run"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o100, 0o100);

        let meta = MetadataStore::new(&config.metadata_file).read().unwrap();
        assert_eq!(meta.version, "4.2.0");
    }

    #[cfg(unix)]
    #[test]
    fn incomplete_directory_is_replaced() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/a.tgz").with_body(release_tgz()).create();
        let config = config_for(dir.path(), "true", &[]);
        let stale = config.release_dir("4.2.0").join("leftover.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "partial").unwrap();

        let rec = record("4.2.0", format!("{}/a.tgz", server.url()));
        let inst = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap();
        assert!(inst.fresh);
        assert!(is_complete(&inst.path));
        assert!(!stale.exists());
    }

    #[cfg(unix)]
    #[test]
    fn force_reinstalls_existing_release() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let m = server
            .mock("GET", "/a.tgz")
            .with_body(release_tgz())
            .expect(2)
            .create();
        let config = config_for(dir.path(), "true", &[]);
        let rec = record("4.2.0", format!("{}/a.tgz", server.url()));

        ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap();
        let inst = ensure_installed(&config, &rec, true, &CancelToken::new()).unwrap();
        assert!(inst.fresh);
        m.assert();
    }

    #[test]
    fn download_failure_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/missing.tgz")
            .with_status(404)
            .with_body("not found")
            .create();
        let config = config_for(dir.path(), "true", &[]);
        let rec = record("4.3.0", format!("{}/missing.tgz", server.url()));

        let err = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InstallError::DownloadFailed(FetchError::Status { .. })));
        assert!(err.to_string().contains("not found"));
        assert!(!config.release_dir("4.3.0").exists());
    }

    #[test]
    fn corrupt_archive_is_extract_failure() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/bad.tgz").with_body("not gzip").create();
        let config = config_for(dir.path(), "true", &[]);
        let rec = record("4.3.0", format!("{}/bad.tgz", server.url()));

        let err = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InstallError::ExtractFailed(_)));
        assert!(!config.release_dir("4.3.0").exists());
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store").join("releases").join("4.0.0");
        let archive = make_tgz(&[
            Item::File("package/ok.txt", b"ok", 0o644),
            Item::RawFile("../../evil.txt", b"pwned"),
        ]);

        let err = extract_archive(&archive[..], &root, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InstallError::ExtractFailed(ref m) if m.contains("invalid file path")));
        assert!(!dir.path().join("store").join("evil.txt").exists());
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn traversal_during_install_cleans_up() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/evil.tgz")
            .with_body(make_tgz(&[
                Item::File("package/ok.txt", b"ok", 0o644),
                Item::RawFile("package/../../../passwd", b"root"),
            ]))
            .create();
        let config = config_for(dir.path(), "true", &[]);
        let rec = record("4.0.0", format!("{}/evil.tgz", server.url()));

        let err = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InstallError::ExtractFailed(_)));
        assert!(!config.release_dir("4.0.0").exists());
        assert!(!config.store_dir.join("passwd").exists());
    }

    #[test]
    fn symlink_entries_are_rejected() {
        let dir = tempdir().unwrap();
        let archive = make_tgz(&[Item::Symlink("package/link", "target.txt")]);
        let err = extract_archive(&archive[..], dir.path(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InstallError::ExtractFailed(ref m) if m.contains("unexpected tar entry type")));
    }

    #[test]
    fn join_inside_cases() {
        let root = Path::new("/store/releases/4.0.0");
        assert_eq!(
            join_inside(root, Path::new("./package/a/../b.js")).unwrap(),
            root.join("package").join("b.js")
        );
        assert!(join_inside(root, Path::new("../4.0.1/x")).is_err());
        assert!(join_inside(root, Path::new("/etc/passwd")).is_err());
        assert!(join_inside(root, Path::new("./")).is_err());
    }

    #[test]
    fn cancelled_before_download() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path(), "true", &[]);
        let rec = record("4.0.0", "http://127.0.0.1:1/a.tgz".to_string());
        let token = CancelToken::new();
        token.cancel();

        let err = ensure_installed(&config, &rec, false, &token).unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
        assert!(!config.release_dir("4.0.0").exists());
    }

    #[test]
    fn cancelled_between_entries() {
        let dir = tempdir().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = extract_archive(&release_tgz()[..], dir.path(), &token).unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
    }

    #[cfg(unix)]
    #[test]
    fn post_install_failure_carries_output_and_cleans_up() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/a.tgz").with_body(release_tgz()).create();
        let config = config_for(dir.path(), "sh", &["-c", "echo boom; echo oops >&2; exit 3"]);
        let rec = record("4.2.0", format!("{}/a.tgz", server.url()));

        let err = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap_err();
        match &err {
            InstallError::PostInstallFailed { status, output, dir, .. } => {
                assert_eq!(status, "exit code 3");
                assert!(output.contains("boom"));
                assert!(output.contains("oops"));
                assert!(dir.ends_with("4.2.0/package"));
            }
            other => panic!("expected PostInstallFailed, got {other:?}"),
        }
        assert!(!config.release_dir("4.2.0").exists());
        assert!(MetadataStore::new(&config.metadata_file).read().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn post_install_runs_inside_package_dir() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/a.tgz").with_body(release_tgz()).create();
        let config = config_for(dir.path(), "sh", &["-c", "test -f package.json && touch installed"]);
        let rec = record("4.2.0", format!("{}/a.tgz", server.url()));

        let inst = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap();
        assert!(inst.path.join("package/installed").exists());
    }

    #[cfg(unix)]
    #[test]
    fn post_install_killed_by_signal_is_cancelled() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/a.tgz").with_body(release_tgz()).create();
        let config = config_for(dir.path(), "sh", &["-c", "kill -TERM $$"]);
        let rec = record("4.2.0", format!("{}/a.tgz", server.url()));

        let err = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
        assert!(!config.release_dir("4.2.0").exists());
    }

    #[cfg(unix)]
    #[test]
    fn post_install_missing_program() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/a.tgz").with_body(release_tgz()).create();
        let config = config_for(dir.path(), "/nonexistent/npm-does-not-exist", &[]);
        let rec = record("4.2.0", format!("{}/a.tgz", server.url()));

        let err = ensure_installed(&config, &rec, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InstallError::PostInstallFailed { ref status, .. } if status.starts_with("failed to start")));
        assert!(!config.release_dir("4.2.0").exists());
    }

    fn cancel_after(token: &CancelToken, delay: Duration) {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            token.cancel();
        });
    }

    #[test]
    fn cancel_while_server_is_silent() {
        let dir = tempdir().unwrap();
        let mut config = config_for(dir.path(), "true", &[]);
        config.archive_timeout = Duration::from_secs(60);
        let rec = record("4.2.0", format!("{}/a.tgz", test_servers::silent()));
        let token = CancelToken::new();
        cancel_after(&token, Duration::from_millis(300));

        let started = Instant::now();
        let err = ensure_installed(&config, &rec, false, &token).unwrap_err();
        assert!(matches!(err, InstallError::Cancelled), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!config.release_dir("4.2.0").exists());
    }

    #[test]
    fn cancel_during_body_transfer() {
        let dir = tempdir().unwrap();
        let mut config = config_for(dir.path(), "true", &[]);
        config.archive_timeout = Duration::from_secs(60);
        let tgz = release_tgz();
        let url = test_servers::stalling(tgz[..tgz.len() / 2].to_vec(), tgz.len());
        let rec = record("4.2.0", format!("{url}/a.tgz"));
        let token = CancelToken::new();
        cancel_after(&token, Duration::from_millis(300));

        let started = Instant::now();
        let err = ensure_installed(&config, &rec, false, &token).unwrap_err();
        assert!(matches!(err, InstallError::Cancelled), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!config.release_dir("4.2.0").exists());
        assert!(MetadataStore::new(&config.metadata_file).read().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn cancel_during_post_install() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/a.tgz").with_body(release_tgz()).create();
        let config = config_for(dir.path(), "sh", &["-c", "sleep 30"]);
        let rec = record("4.2.0", format!("{}/a.tgz", server.url()));
        let token = CancelToken::new();
        cancel_after(&token, Duration::from_millis(500));

        let started = Instant::now();
        let err = ensure_installed(&config, &rec, false, &token).unwrap_err();
        assert!(matches!(err, InstallError::Cancelled), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!config.release_dir("4.2.0").exists());
    }
}
