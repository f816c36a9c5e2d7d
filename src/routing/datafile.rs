//! External Data Resolution
//!
//! Expands `geosite:<name>` and `geoip:<name>` parameters in place from list
//! files under the data directory:
//!
//! - `<data_dir>/geosite/<name>.list` or `<name>.json`
//! - `<data_dir>/geoip/<name>.list` or `<name>.json`
//!
//! `.list` files hold one entry per line (`#` comments allowed), `.json` files
//! hold a JSON array of strings. Geosite entries use the `full:`, `keyword:`,
//! `domain:` prefixes; a bare entry is a suffix. Geoip entries are CIDRs or
//! single addresses.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ipnet::IpNet;
use tracing::debug;

use super::error::RoutingError;
use super::optimizer::{canonical_value, RulesOptimizer};
use super::types::*;

/// Resolves geosite/geoip references against a data directory
#[derive(Debug)]
pub struct DataFileOptimizer {
    data_dir: PathBuf,
    // the same list is often referenced by several rules
    loaded: Mutex<HashMap<(String, String), Vec<Param>>>,
}

impl DataFileOptimizer {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn expand(&self, kind: &str, name: &str, line: usize) -> Result<Vec<Param>, RoutingError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(RoutingError::syntax(
                line,
                format!("invalid {} name '{}'", kind, name),
            ));
        }

        let cache_key = (kind.to_string(), name.to_string());
        if let Some(params) = self
            .loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&cache_key)
        {
            return Ok(params.clone());
        }

        let (path, entries) = self.read_entries(kind, name)?;
        let params = entries
            .iter()
            .map(|entry| match kind {
                KEY_GEOSITE => parse_site_entry(entry),
                _ => parse_ip_entry(entry),
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(|message| RoutingError::Format {
                path: path.clone(),
                message,
            })?;

        debug!("Loaded {} entries from {}", params.len(), path.display());
        self.loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(cache_key, params.clone());
        Ok(params)
    }

    fn read_entries(&self, kind: &str, name: &str) -> Result<(PathBuf, Vec<String>), RoutingError> {
        let dir = self.data_dir.join(kind);

        let list = dir.join(format!("{}.list", name));
        match fs::read_to_string(&list) {
            Ok(text) => {
                let entries = text
                    .lines()
                    .map(|l| l.split('#').next().unwrap_or("").trim())
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                return Ok((list, entries));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RoutingError::Format {
                    path: list,
                    message: e.to_string(),
                })
            }
        }

        let json = dir.join(format!("{}.json", name));
        match fs::read_to_string(&json) {
            Ok(text) => {
                let entries: Vec<String> =
                    serde_json::from_str(&text).map_err(|e| RoutingError::Format {
                        path: json.clone(),
                        message: e.to_string(),
                    })?;
                Ok((json, entries))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RoutingError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                dir,
            }),
            Err(e) => Err(RoutingError::Format {
                path: json,
                message: e.to_string(),
            }),
        }
    }
}

fn parse_site_entry(entry: &str) -> Result<Param, String> {
    // attributes such as "example.com @ads" are ignored
    let entry = entry.split_whitespace().next().unwrap_or("");
    let (key, value) = match entry.split_once(':') {
        Some(("full", v)) => (KEY_FULL, v),
        Some(("keyword", v)) => (KEY_KEYWORD, v),
        Some(("domain", v)) => (KEY_SUFFIX, v),
        Some((prefix, _)) => return Err(format!("unsupported entry type '{}'", prefix)),
        None => (KEY_SUFFIX, entry),
    };
    let value = canonical_value(key, value);
    if value.is_empty() {
        return Err(format!("empty domain in entry '{}'", entry));
    }
    Ok(Param::new(key, value))
}

fn parse_ip_entry(entry: &str) -> Result<Param, String> {
    if entry.parse::<IpNet>().is_ok() || entry.parse::<IpAddr>().is_ok() {
        Ok(Param::new(KEY_CIDR, entry))
    } else {
        Err(format!("invalid address '{}'", entry))
    }
}

impl RulesOptimizer for DataFileOptimizer {
    fn name(&self) -> &'static str {
        "datafile"
    }

    fn optimize(&self, mut policy: RoutingPolicy) -> Result<RoutingPolicy, RoutingError> {
        for rule in &mut policy.rules {
            for clause in &mut rule.clauses {
                let needs_expansion = clause
                    .params
                    .iter()
                    .any(|p| p.key == KEY_GEOSITE || p.key == KEY_GEOIP);
                if !needs_expansion {
                    continue;
                }

                let mut expanded = Vec::with_capacity(clause.params.len());
                for param in std::mem::take(&mut clause.params) {
                    match param.key.as_str() {
                        KEY_GEOSITE if clause.function == Function::Domain => {
                            expanded.extend(self.expand(KEY_GEOSITE, &param.value, rule.line)?)
                        }
                        KEY_GEOIP if clause.function != Function::Domain => {
                            expanded.extend(self.expand(KEY_GEOIP, &param.value, rule.line)?)
                        }
                        _ => expanded.push(param),
                    }
                }
                clause.params = expanded;
            }
        }
        Ok(policy)
    }
}
