// main.rs — arg handling and orchestration only.
// Components report outcomes; this file alone prints fatal errors and picks exit codes.
mod cancel;
mod config;
mod exec;
mod http;
mod index;
mod install;
mod metadata;
mod progress;
mod project;
mod resolve;
mod update;

use std::path::{Path, PathBuf};

use colored::Colorize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use cancel::{CancelToken, Cancelled};
use config::{launcher_config, LauncherConfig};
use install::InstallError;
use project::ProjectError;
use resolve::ResolveError;
use update::UpdateError;

/// Exit code for a user interrupt during installation.
const EXIT_INTERRUPTED: i32 = 130;

/// `serverless update` as the first argument.
fn is_update_command(args: &[String]) -> bool {
    args.first().is_some_and(|a| a == "update")
}

/// The release picked for this run.
#[derive(Debug)]
struct Selected {
    version: String,
    path: PathBuf,
    latest_version: String,
}

fn main() {
    init_tracing();
    let code = match run() {
        Ok(code) => code,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SLS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Cancelled install, or an interrupt observed anywhere before the hand-off.
fn is_interrupt(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        e.is::<Cancelled>() || matches!(e.downcast_ref::<InstallError>(), Some(InstallError::Cancelled))
    })
}

fn report(err: &anyhow::Error) -> i32 {
    if is_interrupt(err) {
        eprintln!("Installation interrupted");
        return EXIT_INTERRUPTED;
    }
    if let Some(e @ UpdateError::UnsupportedPlatform { .. }) = err.downcast_ref::<UpdateError>() {
        eprintln!("{e}");
        return 1;
    }
    eprintln!("Error: {err:#}");
    1
}

fn run() -> anyhow::Result<i32> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = launcher_config()?;
    config.ensure_dirs()?;
    debug!(store = %config.store_dir.display(), "release store");

    let token = CancelToken::new();
    token.install_signal_handler()?;

    let update = is_update_command(&args);
    if update {
        update::self_update(&config, &token)?;
        token.check()?;
    }

    let cwd = std::env::current_dir()?;
    if let Some(script) = project::legacy_local_install(&cwd) {
        token.check()?;
        return exec::run_node(&script, &args);
    }

    let config_file = project::resolve_config_path(&args, &cwd, dirs::home_dir().as_deref());
    let force = update || config.force_update;
    let release = select_release(&config, config_file.as_deref(), force, &token)?;

    exec::check_node()?;

    if update {
        println!("✔ Update completed");
        if release.latest_version != release.version {
            println!(
                "{}",
                format!(
                    "A new version, {}, has been released. Update your `frameworkVersion` property to use it",
                    release.latest_version
                )
                .yellow()
            );
        }
        return Ok(0);
    }

    hand_off(&release, &args, &token)
}

/// Last point where an interrupt belongs to the launcher. Afterwards the
/// handler stays installed so the launcher outlives the downstream tool,
/// which receives the same signal.
fn hand_off(release: &Selected, args: &[String], token: &CancelToken) -> anyhow::Result<i32> {
    token.check()?;
    exec::run_framework(&release.path, args)
}

/// Config file → constraint → resolved release → installed path.
fn select_release(
    config: &LauncherConfig,
    config_file: Option<&Path>,
    force: bool,
    token: &CancelToken,
) -> anyhow::Result<Selected> {
    let declared = match project::framework_version(config_file) {
        Ok(v) => v,
        Err(ProjectError::ConfigNotFound) | Err(ProjectError::NoFrameworkVersionDeclared(_)) => {
            String::new()
        }
        Err(e) => {
            eprintln!("{e}");
            return local_fallback(config, "", token);
        }
    };

    let resolved = match resolve::resolve_release(config, &declared, force, token) {
        Ok(r) => r,
        Err(ResolveError::Index(e)) if declared.is_empty() => {
            warn!(error = %e, "release index unavailable, falling back to installed releases");
            return local_fallback(config, "", token);
        }
        Err(e) => return Err(e.into()),
    };

    if resolved.canary {
        eprintln!("{}", "Using Canary release channel".yellow());
    }

    if resolved.blocked {
        println!(
            "WARNING: This version, {}, of Serverless Framework contains known bugs or security issues and has been flagged. We recommend you upgrade to a more recent version.",
            resolved.record.version
        );
    }

    let installation = install::ensure_installed(config, &resolved.record, force, token)?;
    if installation.fresh {
        eprintln!("✔ Installed Serverless Framework v{}", resolved.record.version);
        if resolved.print_warning {
            println!(
                "{}",
                format!(
                    "Disable auto-updates by adding \"frameworkVersion\" to your serverless.yml (frameworkVersion: ~{})",
                    resolved.record.version
                )
                .truecolor(140, 141, 145)
            );
        }
    }

    token.check()?;
    Ok(Selected {
        version: resolved.record.version,
        path: installation.path,
        latest_version: resolved.record.latest_version,
    })
}

fn local_fallback(
    config: &LauncherConfig,
    constraint: &str,
    token: &CancelToken,
) -> anyhow::Result<Selected> {
    token.check()?;
    let version = resolve::local_release(config, constraint)?;
    Ok(Selected {
        path: config.release_dir(&version),
        latest_version: version.clone(),
        version,
    })
}
