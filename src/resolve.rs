use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::cancel::{self, CancelToken, Cancelled};
use crate::config::LauncherConfig;
use crate::http::{self, FetchError};
use crate::index::{IndexCache, IndexError, ReleaseIndex};
use crate::install;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("invalid version constraint {constraint:?}: {source}")]
    InvalidConstraint {
        constraint: String,
        #[source]
        source: semver::Error,
    },
    #[error("invalid version {version:?} in supported versions: {source}")]
    InvalidVersionInList {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("no version found for {constraint}")]
    NoMatchingVersion { constraint: String },
    #[error("no supported versions available")]
    NoSupportedVersions,
    #[error("fetching canary releases: {0}")]
    Canary(#[source] FetchError),
    #[error("canary releases.json is invalid: {0}")]
    InvalidCanary(#[source] serde_json::Error),
    #[error("invalid canary version {0:?}")]
    InvalidCanaryVersion(String),
    #[error("no installed releases found in {0}")]
    NoLocalReleases(String),
    #[error("building HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("version lookup interrupted")]
    Interrupted(#[from] Cancelled),
}

/// Result of matching a constraint against the index.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub version: String,
    /// No constraint was given in CI: suggest pinning `frameworkVersion`.
    pub print_warning: bool,
    /// The constraint itself names a blocked version.
    pub blocked: bool,
}

/// Where a resolved release comes from. Rebuilt on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRecord {
    pub version: String,
    pub release_date: DateTime<Utc>,
    pub download_url: String,
    pub latest_version: String,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub record: ReleaseRecord,
    pub print_warning: bool,
    pub blocked: bool,
    pub canary: bool,
}

pub fn is_canary(constraint: &str) -> bool {
    constraint.starts_with("canary")
}

/// Pick a version from `index` for `constraint`.
///
/// An empty constraint selects the last supported entry as published; the
/// list is never re-sorted for that case. A constraint naming a blocked
/// version still resolves to it, flagged.
pub fn resolve(constraint: &str, index: &ReleaseIndex, ci: bool) -> Result<Resolution, ResolveError> {
    if constraint.is_empty() {
        let latest = index.latest().ok_or(ResolveError::NoSupportedVersions)?;
        return Ok(Resolution {
            version: latest.to_string(),
            print_warning: ci,
            blocked: false,
        });
    }

    let version = find_closest_match(&index.supported_versions, constraint)?;
    Ok(Resolution {
        blocked: index.is_blocked(constraint),
        version,
        print_warning: false,
    })
}

/// Highest entry of `versions` satisfying `constraint`, in its original spelling.
pub fn find_closest_match(versions: &[String], constraint: &str) -> Result<String, ResolveError> {
    let reqs = parse_constraint(constraint)?;

    let mut parsed = Vec::with_capacity(versions.len());
    for v in versions {
        let sv = parse_version(v).map_err(|source| ResolveError::InvalidVersionInList {
            version: v.clone(),
            source,
        })?;
        parsed.push((sv, v));
    }
    parsed.sort_by(|a, b| b.0.cmp(&a.0));

    parsed
        .into_iter()
        .find(|(sv, _)| reqs.iter().any(|r| r.matches(sv)))
        .map(|(_, original)| original.clone())
        .ok_or_else(|| ResolveError::NoMatchingVersion {
            constraint: constraint.to_string(),
        })
}

/// Parse a version, tolerating a leading `v` and missing minor/patch parts.
pub fn parse_version(v: &str) -> Result<Version, semver::Error> {
    let s = v.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    let core_len = s.find(['-', '+']).unwrap_or(s.len());
    let dots = s[..core_len].matches('.').count();
    match dots {
        0 => Version::parse(&format!("{}.0.0{}", &s[..core_len], &s[core_len..])),
        1 => Version::parse(&format!("{}.0{}", &s[..core_len], &s[core_len..])),
        _ => Version::parse(s),
    }
}

/// `||`-separated alternatives of comma/space-separated comparators.
/// A bare version means exactly that version.
fn parse_constraint(constraint: &str) -> Result<Vec<VersionReq>, ResolveError> {
    let invalid = |source| ResolveError::InvalidConstraint {
        constraint: constraint.to_string(),
        source,
    };

    let mut alternatives = Vec::new();
    for alt in constraint.split("||") {
        let req = VersionReq::parse(&comparators(alt).join(", ")).map_err(invalid)?;
        alternatives.push(req);
    }
    Ok(alternatives)
}

/// Split one alternative into comparators. An operator written apart from
/// its version (`>= 4.0.0`) is rejoined, and `a - b` becomes `>=a, <=b`.
fn comparators(alt: &str) -> Vec<String> {
    let tokens: Vec<&str> = alt
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if tokens.get(i + 1) == Some(&"-") && i + 2 < tokens.len() {
            out.push(normalize_comparator(&format!(">={token}")));
            out.push(normalize_comparator(&format!("<={}", tokens[i + 2])));
            i += 3;
        } else if is_operator(token) && i + 1 < tokens.len() {
            out.push(normalize_comparator(&format!("{token}{}", tokens[i + 1])));
            i += 2;
        } else {
            out.push(normalize_comparator(token));
            i += 1;
        }
    }
    out
}

fn is_operator(token: &str) -> bool {
    token.chars().all(|c| matches!(c, '=' | '>' | '<' | '~' | '^'))
}

fn normalize_comparator(token: &str) -> String {
    let op_len = token
        .find(|c: char| !matches!(c, '=' | '>' | '<' | '~' | '^'))
        .unwrap_or(token.len());
    let (op, rest) = token.split_at(op_len);
    let rest = rest.strip_prefix('v').unwrap_or(rest);
    let wildcard = rest.contains(['x', 'X', '*']);
    if op.is_empty() && !wildcard && rest.starts_with(|c: char| c.is_ascii_digit()) {
        format!("={rest}")
    } else {
        format!("{op}{rest}")
    }
}

#[derive(Deserialize)]
struct CanaryRelease {
    version: String,
}

pub fn latest_canary_version(
    client: &reqwest::blocking::Client,
    base_url: &str,
) -> Result<String, ResolveError> {
    let body = http::fetch_url(client, &format!("{}/releases.json", base_url))
        .map_err(ResolveError::Canary)?;
    let release: CanaryRelease = serde_json::from_slice(&body).map_err(ResolveError::InvalidCanary)?;
    Ok(release.version)
}

/// A canary id becomes a directory under `releases/` and part of a URL, so
/// it must be a single plain path component.
fn valid_canary_name(version: &str) -> bool {
    version
        .strip_prefix("canary-")
        .is_some_and(|id| !id.is_empty() && !id.contains(['/', '\\']) && !id.contains(".."))
}

/// Turn a declared constraint (possibly empty) into a concrete release.
///
/// Network lookups run under `token` and return [`ResolveError::Interrupted`]
/// as soon as it is set.
pub fn resolve_release(
    config: &LauncherConfig,
    constraint: &str,
    force: bool,
    token: &CancelToken,
) -> Result<Resolved, ResolveError> {
    if is_canary(constraint) {
        let version = if constraint == "canary" {
            let client = http::client(None)?;
            let base_url = config.canary_base_url.clone();
            let latest =
                cancel::run_cancellable(token, move || latest_canary_version(&client, &base_url))??;
            if latest.starts_with("canary-") {
                latest
            } else {
                format!("canary-{latest}")
            }
        } else {
            constraint.to_string()
        };
        if !valid_canary_name(&version) {
            return Err(ResolveError::InvalidCanaryVersion(version));
        }
        debug!(%version, "resolved canary release");
        return Ok(Resolved {
            record: ReleaseRecord {
                download_url: format!("{}/archives/{}.tgz", config.canary_base_url, version),
                latest_version: version.clone(),
                version,
                release_date: Utc::now(),
            },
            print_warning: false,
            blocked: false,
            canary: true,
        });
    }

    let cache = IndexCache::new(config)?;
    let index = cancel::run_cancellable(token, move || cache.get_index(force))??;
    let resolution = resolve(constraint, &index, config.ci)?;
    debug!(constraint, version = %resolution.version, "resolved release");

    Ok(Resolved {
        record: ReleaseRecord {
            download_url: format!(
                "{}/archives/serverless-{}.tgz",
                config.install_base_url, resolution.version
            ),
            latest_version: index.latest().unwrap_or(&resolution.version).to_string(),
            version: resolution.version,
            release_date: Utc::now(),
        },
        print_warning: resolution.print_warning,
        blocked: resolution.blocked,
        canary: false,
    })
}

/// Greatest complete release already on disk, optionally matching `constraint`.
pub fn local_release(config: &LauncherConfig, constraint: &str) -> Result<String, ResolveError> {
    let no_local = || ResolveError::NoLocalReleases(config.releases_dir.display().to_string());

    let entries = std::fs::read_dir(&config.releases_dir).map_err(|_| no_local())?;
    let installed: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| install::is_complete(&e.path()))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();

    if is_canary(constraint) && constraint != "canary" {
        return installed
            .into_iter()
            .find(|v| v == constraint)
            .ok_or_else(no_local);
    }

    let reqs = if constraint.is_empty() || is_canary(constraint) {
        None
    } else {
        Some(parse_constraint(constraint)?)
    };

    installed
        .into_iter()
        .filter(|v| !is_canary(v))
        .filter_map(|v| parse_version(&v).ok().map(|sv| (sv, v)))
        .filter(|(sv, _)| reqs.as_ref().map_or(true, |r| r.iter().any(|r| r.matches(sv))))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v)
        .ok_or_else(no_local)
}
