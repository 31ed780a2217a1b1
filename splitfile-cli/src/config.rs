//! Load config from file and environment.

use serde::Deserialize;
use splitfile_core::{HealerConfig, InsertConfig, RequestConfig};
use std::path::PathBuf;

/// CLI configuration. File: ~/.config/splitfile/config.toml or /etc/splitfile/config.toml.
/// Env overrides: SPLITFILE_STORE_DIR, SPLITFILE_MAX_THREADS, SPLITFILE_RETRIES,
/// SPLITFILE_PARANOID, SPLITFILE_RANDOM_SEGS, SPLITFILE_BACKGROUND_HEAL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Block store directory (default ~/.local/share/splitfile/blocks).
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Hand heal inserts to a background healer instead of awaiting them (default false).
    #[serde(default)]
    pub background_heal: bool,
    #[serde(default)]
    pub insert: InsertConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub healer: HealerConfig,
}

fn default_store_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/splitfile/blocks"),
        None => PathBuf::from("splitfile-blocks"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            background_heal: false,
            insert: InsertConfig::default(),
            request: RequestConfig::default(),
            healer: HealerConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SPLITFILE_STORE_DIR") {
        c.store_dir = PathBuf::from(s);
    }
    if let Some(n) = var("SPLITFILE_MAX_THREADS").and_then(|s| s.parse::<usize>().ok()) {
        c.insert.max_threads = n;
        c.request.max_threads = n;
    }
    if let Some(n) = var("SPLITFILE_RETRIES").and_then(|s| s.parse::<u32>().ok()) {
        c.insert.retries = n;
        c.request.retries = n;
    }
    if let Some(b) = var("SPLITFILE_PARANOID").and_then(|s| parse_bool(&s)) {
        c.request.paranoid = b;
    }
    if let Some(b) = var("SPLITFILE_RANDOM_SEGS").and_then(|s| parse_bool(&s)) {
        c.request.random_segs = b;
    }
    if let Some(b) = var("SPLITFILE_BACKGROUND_HEAL").and_then(|s| parse_bool(&s)) {
        c.background_heal = b;
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/splitfile/config.toml"));
    }
    out.push(PathBuf::from("/etc/splitfile/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_sections_merge_with_defaults() {
        let c: Config = toml::from_str(
            r#"
            store_dir = "/var/lib/blocks"
            [request]
            paranoid = true
            heal_percentage = 50
            "#,
        )
        .unwrap();
        assert_eq!(c.store_dir, PathBuf::from("/var/lib/blocks"));
        assert!(c.request.paranoid);
        assert_eq!(c.request.heal_percentage, 50);
        assert_eq!(c.insert.retries, 3);
        assert!(!c.background_heal);
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("SPLITFILE_MAX_THREADS", "3"),
            ("SPLITFILE_RANDOM_SEGS", "yes"),
            ("SPLITFILE_RETRIES", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |name| env.get(name).map(|v| v.to_string()));
        assert_eq!(c.insert.max_threads, 3);
        assert_eq!(c.request.max_threads, 3);
        assert!(c.request.random_segs);
        assert_eq!(c.request.retries, 3);
    }
}
