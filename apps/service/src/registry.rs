//! Target inventory and profile loading.
//!
//! The inventory binds each target to a named profile; profiles are
//! reusable check templates. `materialize` binds every target to its
//! profile eagerly, so a configuration either validates as a whole or is
//! rejected before anything is scheduled.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::config::{self, ConfigError, Settings, parse_duration};
use crate::probe::types::{CheckKind, CheckParams, ResolvedCheck, StatusRange};
use crate::template::Template;

/// One addressable entity to be checked.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Target {
    pub id: String,
    pub address: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Extra placeholder values; override the built-in `address` variable.
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

fn default_profile() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default, rename = "target")]
    targets: Vec<Target>,
}

/// One check definition inside a profile. String parameters may contain
/// `${placeholder}` references.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckDef {
    pub name: String,
    pub kind: CheckKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub expect_status: Option<String>,
    #[serde(default)]
    pub expect_text: Option<String>,
    #[serde(default)]
    pub accept_error_substring: Option<String>,
    #[serde(default)]
    pub process_limit: Option<usize>,
    #[serde(default)]
    pub gpu: Option<bool>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
}

/// Named, reusable template of checks; shared by every target that
/// references it.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    #[serde(default, rename = "check")]
    pub checks: Vec<CheckDef>,
}

/// Load the target inventory. Duplicate ids are rejected.
pub fn load_inventory(path: &Path) -> Result<Vec<Target>, ConfigError> {
    let raw = config::read_to_string(path)?;
    let file: InventoryFile = toml::from_str(&raw)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

    let mut seen = HashSet::new();
    for target in &file.targets {
        if !seen.insert(target.id.clone()) {
            return Err(ConfigError::DuplicateTarget(target.id.clone()));
        }
    }
    Ok(file.targets)
}

/// Load every `*.toml` profile in the directory, keyed by file stem.
pub fn load_profiles(dir: &Path) -> Result<HashMap<String, Profile>, ConfigError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::Io { path: dir.to_path_buf(), source })?;

    let mut profiles = HashMap::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io { path: dir.to_path_buf(), source })?;
        let path = entry.path();
        if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };

        let raw = config::read_to_string(&path)?;
        let profile: Profile =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;

        let mut seen = HashSet::new();
        for check in &profile.checks {
            if !seen.insert(check.name.clone()) {
                return Err(ConfigError::DuplicateCheck {
                    profile: name.clone(),
                    check: check.name.clone(),
                });
            }
        }
        profiles.insert(name, profile);
    }
    Ok(profiles)
}

/// Target-level difference between two inventories, used to apply minimal
/// scheduler updates on reload.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff(old: &[Target], new: &[Target]) -> InventoryDiff {
    let old_by_id: HashMap<&str, &Target> = old.iter().map(|t| (t.id.as_str(), t)).collect();
    let new_by_id: HashMap<&str, &Target> = new.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut diff = InventoryDiff::default();
    for target in new {
        match old_by_id.get(target.id.as_str()) {
            None => diff.added.push(target.id.clone()),
            Some(previous) if *previous != target => diff.changed.push(target.id.clone()),
            Some(_) => {}
        }
    }
    for target in old {
        if !new_by_id.contains_key(target.id.as_str()) {
            diff.removed.push(target.id.clone());
        }
    }
    diff.added.sort();
    diff.removed.sort();
    diff.changed.sort();
    diff
}

/// Bind every target to its profile, substituting placeholders. Pure and
/// deterministic; any unresolved reference fails the whole set here, never
/// at execution time.
pub fn materialize(
    targets: &[Target],
    profiles: &HashMap<String, Profile>,
    settings: &Settings,
) -> Result<Vec<ResolvedCheck>, ConfigError> {
    let mut resolved = Vec::new();

    for target in targets {
        let profile = profiles.get(&target.profile).ok_or_else(|| ConfigError::UnknownProfile {
            target: target.id.clone(),
            profile: target.profile.clone(),
        })?;

        let mut vars = HashMap::new();
        vars.insert("address".to_string(), target.address.clone());
        vars.extend(target.vars.clone());

        for def in &profile.checks {
            resolved.push(resolve_check(target, &target.profile, def, &vars, settings)?);
        }
    }
    Ok(resolved)
}

fn resolve_check(
    target: &Target,
    profile_name: &str,
    def: &CheckDef,
    vars: &HashMap<String, String>,
    settings: &Settings,
) -> Result<ResolvedCheck, ConfigError> {
    let render = |input: &str| -> Result<String, ConfigError> {
        Template::parse(input).render(vars).map_err(|source| ConfigError::Placeholder {
            target: target.id.clone(),
            check: def.name.clone(),
            source,
        })
    };

    let params = match def.kind {
        CheckKind::Ping => {
            let host = render(def.host.as_deref().unwrap_or("${address}"))?;
            CheckParams::Ping { host, count: def.count.unwrap_or(settings.ping_count).max(1) }
        }
        CheckKind::Http => {
            let raw_url = def.url.as_deref().ok_or(ConfigError::MissingField {
                profile: profile_name.to_string(),
                check: def.name.clone(),
                field: "url",
            })?;
            let url = render(raw_url)?;
            Url::parse(&url).map_err(|source| ConfigError::InvalidUrl {
                target: target.id.clone(),
                check: def.name.clone(),
                url: url.clone(),
                source,
            })?;

            let method = def.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
            reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
                ConfigError::InvalidMethod {
                    target: target.id.clone(),
                    check: def.name.clone(),
                    method: method.clone(),
                }
            })?;

            let expect_status = match &def.expect_status {
                Some(range) => {
                    StatusRange::parse(range).ok_or_else(|| ConfigError::InvalidStatusRange {
                        profile: profile_name.to_string(),
                        check: def.name.clone(),
                        range: range.clone(),
                    })?
                }
                None => StatusRange::DEFAULT,
            };

            let expect_text = def.expect_text.as_deref().map(render).transpose()?;

            CheckParams::Http {
                url,
                method,
                expect_status,
                expect_text,
                accept_error_substring: def.accept_error_substring.clone(),
            }
        }
        CheckKind::Resource => CheckParams::Resource {
            process_limit: def.process_limit.unwrap_or(settings.process_limit),
            gpu: def.gpu.unwrap_or(settings.gpu),
            proc_root: settings.proc_root.clone(),
        },
    };

    let timeout = def
        .timeout
        .as_deref()
        .map(|s| parse_duration(s, settings.timeout))
        .unwrap_or(settings.timeout);
    let raw_interval = def
        .interval
        .as_deref()
        .map(|s| parse_duration(s, settings.poll_interval))
        .unwrap_or(settings.poll_interval);
    let interval = settings.clamp_interval(raw_interval);
    if interval != raw_interval {
        warn!(
            target_id = %target.id,
            check = %def.name,
            "check interval below the configured floor, clamped to {:?}",
            interval
        );
    }

    Ok(ResolvedCheck { target_id: target.id.clone(), name: def.name.clone(), params, timeout, interval })
}
