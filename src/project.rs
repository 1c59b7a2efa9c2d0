use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const CONFIG_BASENAMES: [&str; 4] = [
    "serverless",
    "serverless-compose",
    "serverless.containers",
    "serverless.ai",
];
const CONFIG_EXTENSIONS: [&str; 7] = ["yml", "yaml", "js", "ts", "cjs", "mjs", "json"];

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("no serverless configuration file found")]
    ConfigNotFound,
    #[error("{} does not declare frameworkVersion", .0.display())]
    NoFrameworkVersionDeclared(PathBuf),
    #[error("reading framework version from {}: {reason}", path.display())]
    ConfigRead { path: PathBuf, reason: String },
}

/// Value of `--config`/`-c` (either `--config p` or `--config=p`) before any `--`.
pub fn config_arg(args: &[String]) -> Option<&str> {
    let mut iter = args.iter().take_while(|a| *a != "--").peekable();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(value) = iter.peek() {
                return Some(value.as_str());
            }
        } else if let Some(value) = arg
            .strip_prefix("--config=")
            .or_else(|| arg.strip_prefix("-c="))
        {
            return Some(value);
        }
    }
    None
}

/// The project config file to read, if any: an explicit `--config` that
/// points at a file, otherwise the first conventional name found in `cwd`.
pub fn resolve_config_path(args: &[String], cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(arg) = config_arg(args).filter(|a| !a.is_empty()) {
        let mut path = PathBuf::from(arg);
        if let (Some(rest), Some(home)) = (arg.strip_prefix("~/"), home) {
            path = home.join(rest);
        }
        if path.is_relative() {
            path = cwd.join(path);
        }
        if path.is_file() {
            return Some(path);
        }
        debug!(path = %path.display(), "--config does not name a file, searching working directory");
    }
    discover_config(cwd)
}

pub fn discover_config(dir: &Path) -> Option<PathBuf> {
    CONFIG_BASENAMES
        .iter()
        .flat_map(|base| CONFIG_EXTENSIONS.iter().map(move |ext| dir.join(format!("{base}.{ext}"))))
        .find(|p| p.is_file())
}

/// The `frameworkVersion` declared in `path`, trimmed.
pub fn framework_version(path: Option<&Path>) -> Result<String, ProjectError> {
    let path = path.ok_or(ProjectError::ConfigNotFound)?;
    let read_err = |reason: String| ProjectError::ConfigRead {
        path: path.to_path_buf(),
        reason,
    };

    let body = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

    let version = match ext {
        "yml" | "yaml" => {
            let doc: serde_yaml::Value =
                serde_yaml::from_str(&body).map_err(|e| read_err(e.to_string()))?;
            yaml_scalar(doc.get("frameworkVersion")).map_err(read_err)?
        }
        "json" => {
            let doc: serde_json::Value =
                serde_json::from_str(&body).map_err(|e| read_err(e.to_string()))?;
            json_scalar(doc.get("frameworkVersion")).map_err(read_err)?
        }
        _ => script_version(&body),
    };

    match version.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProjectError::NoFrameworkVersionDeclared(path.to_path_buf())),
    }
}

fn yaml_scalar(value: Option<&serde_yaml::Value>) -> Result<Option<String>, String> {
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s.clone())),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err("frameworkVersion must be a string".to_string()),
    }
}

fn json_scalar(value: Option<&serde_json::Value>) -> Result<Option<String>, String> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err("frameworkVersion must be a string".to_string()),
    }
}

/// `frameworkVersion: '<v>'` in a JS/TS config module.
fn script_version(body: &str) -> Option<String> {
    let re = Regex::new(r#"['"]?frameworkVersion['"]?\s*:\s*['"`]([^'"`]+)['"`]"#).ok()?;
    re.captures(body).map(|c| c[1].to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    dev_dependencies: HashMap<String, String>,
}

/// A v3 (or older) framework installed in the project's `node_modules`,
/// which runs instead of a managed release.
pub fn legacy_local_install(cwd: &Path) -> Option<PathBuf> {
    let bin = cwd.join("node_modules/serverless/bin/serverless.js");
    let local_manifest = cwd.join("node_modules/serverless/package.json");
    let project_manifest = cwd.join("package.json");
    if !bin.is_file() || !local_manifest.is_file() || !project_manifest.is_file() {
        return None;
    }

    let body = std::fs::read(&project_manifest).ok()?;
    let manifest: PackageJson = serde_json::from_slice(&body).ok()?;
    let declared = manifest.dev_dependencies.get("serverless")?;
    let major = declared_major(declared)?;
    debug!(declared = %declared, major, "project devDependency on serverless");
    (major < 4).then_some(bin)
}

/// Major version of a dependency range such as `^3.38.0` or `~2`.
fn declared_major(range: &str) -> Option<u64> {
    let digits: String = range
        .trim()
        .trim_start_matches(|c: char| matches!(c, '^' | '~' | '=' | '>' | '<' | 'v' | ' '))
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
