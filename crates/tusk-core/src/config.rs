use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tracing::{debug, info, trace, warn};

/// Nested `include` files stop being followed past this depth.
const INCLUDE_DEPTH_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
    map: HashMap<String, String>,
    pub loaded_files: Vec<PathBuf>,
}

impl Config {
    /// Built-in defaults, overlaid by the rc file if one is found.
    #[tracing::instrument(skip(taskrc_override))]
    pub fn load(taskrc_override: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = Config::defaults();

        let taskrc = resolve_taskrc_path(taskrc_override)?;
        if let Some(path) = taskrc {
            info!(taskrc = %path.display(), "loading taskrc");
            cfg.load_file(&path, 0)?;
        } else {
            warn!("no taskrc found; using defaults");
        }

        Ok(cfg)
    }

    pub fn defaults() -> Self {
        let mut cfg = Config {
            map: HashMap::new(),
            loaded_files: vec![],
        };

        let defaults: &[(&str, &str)] = &[
            ("data.location", "~/.task"),
            ("default.command", "next"),
            ("confirmation", "on"),
            ("gc", "on"),
            ("locking", "on"),
            ("hooks", "on"),
            ("sugar", "on"),
            ("regex", "on"),
            ("search.case.sensitive", "on"),
            ("abbreviation.minimum", "3"),
            ("recurrence.limit", "1"),
            ("weekstart", "Sunday"),
            ("dateformat", "Y-M-D"),
            ("urgency.next.coefficient", "15.0"),
            ("urgency.due.coefficient", "12.0"),
            ("urgency.blocking.coefficient", "8.0"),
            ("urgency.priority.coefficient", "6.0"),
            ("urgency.scheduled.coefficient", "5.0"),
            ("urgency.active.coefficient", "4.0"),
            ("urgency.age.coefficient", "2.0"),
            ("urgency.annotations.coefficient", "1.0"),
            ("urgency.tags.coefficient", "1.0"),
            ("urgency.project.coefficient", "1.0"),
            ("urgency.waiting.coefficient", "-3.0"),
            ("urgency.blocked.coefficient", "-5.0"),
            ("urgency.age.max", "365"),
        ];
        for (k, v) in defaults {
            cfg.map.insert((*k).to_string(), (*v).to_string());
        }

        cfg
    }

    /// `rc.<name>` overrides from the command line; applied after file load,
    /// last writer wins.
    #[tracing::instrument(skip(self, overrides))]
    pub fn apply_overrides<I>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (k, v) in overrides {
            let key = k.strip_prefix("rc.").unwrap_or(&k).to_string();
            debug!(key = %key, value = %v, "applying override");
            self.map.insert(key, v);
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.map.get(key).map(|v| parse_bool(v))
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.map.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_real(&self, key: &str) -> Option<f64> {
        self.map.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.map.iter()
    }

    /// All keys beginning with `prefix`, sorted, for the `urgency.user.*`,
    /// `uda.*` and `alias.*` namespaces.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    #[tracing::instrument(skip(self))]
    fn load_file(&mut self, path: &Path, depth: usize) -> anyhow::Result<()> {
        if depth >= INCLUDE_DEPTH_LIMIT {
            warn!(file = %path.display(), depth, "include nesting limit reached; skipping");
            return Ok(());
        }

        let path = expand_tilde(path);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        self.loaded_files.push(path.clone());

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        for (line_num, raw_line) in text.lines().enumerate() {
            let mut line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((before, _)) = line.split_once('#') {
                line = before.trim();
            }

            if line.is_empty() {
                continue;
            }

            if let Some(include_rest) = line.strip_prefix("include ") {
                let include_path = resolve_include_path(&base_dir, include_rest.trim())?;
                debug!(
                    file = %path.display(),
                    include = %include_path.display(),
                    line = line_num + 1,
                    "processing include"
                );

                if include_path.exists() {
                    self.load_file(&include_path, depth + 1)?;
                } else {
                    warn!(include = %include_path.display(), "include file does not exist; skipping");
                }
                continue;
            }

            let (k, v) = line.split_once('=').ok_or_else(|| {
                anyhow!(
                    "invalid config line {}:{}: {}",
                    path.display(),
                    line_num + 1,
                    raw_line
                )
            })?;

            let key = k.trim().to_string();
            let value = v.trim().to_string();
            trace!(key = %key, value = %value, "loaded config key");
            self.map.insert(key, value);
        }

        Ok(())
    }
}

#[tracing::instrument(skip(cfg, override_dir))]
pub fn resolve_data_dir(cfg: &Config, override_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = if let Some(path) = override_dir {
        path.to_path_buf()
    } else if let Some(cfg_value) = cfg.get("data.location") {
        expand_tilde(Path::new(&cfg_value))
    } else {
        default_data_dir()?
    };

    if !dir.exists() {
        info!(dir = %dir.display(), "creating data directory");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    Ok(dir)
}

#[tracing::instrument(skip(override_path))]
fn resolve_taskrc_path(override_path: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = override_path {
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(taskrc_env) = std::env::var("TASKRC") {
        if taskrc_env == "/dev/null" {
            return Ok(None);
        }
        return Ok(Some(PathBuf::from(taskrc_env)));
    }

    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    let candidate = home.join(".taskrc");
    if candidate.exists() {
        return Ok(Some(candidate));
    }

    Ok(None)
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(home.join(".task"))
}

fn resolve_include_path(base_dir: &Path, include: &str) -> anyhow::Result<PathBuf> {
    if include.trim().is_empty() {
        return Err(anyhow!("include path cannot be empty"));
    }

    let raw = PathBuf::from(include);
    let expanded = expand_tilde(&raw);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(base_dir.join(expanded))
    }
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(rest) = text.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "on" | "true"
    )
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::Config;

    #[test]
    fn overrides_strip_rc_prefix() {
        let mut cfg = Config::defaults();
        cfg.apply_overrides(vec![("rc.gc".to_string(), "off".to_string())]);
        assert_eq!(cfg.get_bool("gc"), Some(false));
    }

    #[test]
    fn typed_getters() {
        let mut cfg = Config::defaults();
        cfg.set("abbreviation.minimum", "2");
        cfg.set("urgency.due.coefficient", "10.5");
        assert_eq!(cfg.get_int("abbreviation.minimum"), Some(2));
        assert_eq!(cfg.get_real("urgency.due.coefficient"), Some(10.5));
    }

    #[test]
    fn include_files_are_read_inline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inner = dir.path().join("inner.rc");
        fs::write(&inner, "gc=off\n").expect("write inner");
        let outer = dir.path().join("outer.rc");
        fs::write(&outer, format!("include {}\nconfirmation=off\n", inner.display()))
            .expect("write outer");

        let mut cfg = Config::defaults();
        cfg.load_file(&outer, 0).expect("load");
        assert_eq!(cfg.get_bool("gc"), Some(false));
        assert_eq!(cfg.get_bool("confirmation"), Some(false));
        assert_eq!(cfg.loaded_files.len(), 2);
    }

    #[test]
    fn include_nesting_is_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loop.rc");
        fs::write(&path, format!("include {}\nkey=value\n", path.display())).expect("write");

        let mut cfg = Config::defaults();
        cfg.load_file(&path, 0).expect("load should not recurse forever");
        assert_eq!(cfg.get("key").as_deref(), Some("value"));
    }

    #[test]
    fn prefix_listing_is_sorted() {
        let mut cfg = Config::defaults();
        cfg.set("alias.rm", "delete");
        cfg.set("alias.burndown", "graph burndown");
        let keys = cfg.keys_with_prefix("alias.");
        assert_eq!(keys, vec!["alias.burndown", "alias.rm"]);
    }
}
