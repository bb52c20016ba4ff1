use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::task::{AttributeRegistry, Task};

/// Runs executable scripts from `<data>/hooks/`. `on-launch.*` scripts gate
/// startup; `on-add.*` and `on-modify.*` receive task JSON on stdin and
/// emit one replacement task JSON line.
#[derive(Debug, Clone)]
pub struct HookRunner {
    enabled: bool,
    hooks_dir: PathBuf,
}

impl HookRunner {
    pub fn new(cfg: &Config, data_dir: &Path) -> Self {
        let enabled = cfg.get_bool("hooks").unwrap_or(true);
        let hooks_dir = data_dir.join("hooks");
        debug!(
            enabled,
            hooks_dir = %hooks_dir.display(),
            "initialized hook runner"
        );
        Self { enabled, hooks_dir }
    }

    #[instrument(skip(self))]
    pub fn run_on_launch(&self) -> Result<()> {
        if !self.enabled {
            debug!("hooks disabled; skipping on-launch");
            return Ok(());
        }
        let scripts = self.list_scripts("on-launch")?;
        debug!(count = scripts.len(), "running on-launch hooks");
        for script in scripts {
            run_hook_no_io(&script)?;
        }
        Ok(())
    }

    #[instrument(skip(self, task, registry))]
    pub fn apply_on_add(&self, task: &Task, registry: &AttributeRegistry) -> Result<Task> {
        if !self.enabled {
            return Ok(task.clone());
        }

        let mut current = task.clone();
        let scripts = self.list_scripts("on-add")?;
        debug!(count = scripts.len(), "running on-add hooks");
        for script in scripts {
            let payload = current.compose_json(registry, false).to_string();
            let response = run_hook_with_json_lines(&script, &[payload], 1)?;
            let value: serde_json::Value = serde_json::from_str(&response[0]).map_err(|_| {
                hook_error(&script, "emitted invalid task JSON")
            })?;
            let mut updated = Task::parse_json(&value, registry)?;
            updated.id = current.id;
            current = updated;
        }
        Ok(current)
    }

    #[instrument(skip(self, old, new, registry))]
    pub fn apply_on_modify(
        &self,
        old: &Task,
        new: &Task,
        registry: &AttributeRegistry,
    ) -> Result<Task> {
        if !self.enabled {
            return Ok(new.clone());
        }

        let mut current = new.clone();
        let scripts = self.list_scripts("on-modify")?;
        debug!(count = scripts.len(), "running on-modify hooks");
        for script in scripts {
            let old_payload = old.compose_json(registry, false).to_string();
            let new_payload = current.compose_json(registry, false).to_string();
            let response = run_hook_with_json_lines(&script, &[old_payload, new_payload], 1)?;
            let value: serde_json::Value = serde_json::from_str(&response[0]).map_err(|_| {
                hook_error(&script, "emitted invalid task JSON")
            })?;
            let mut updated = Task::parse_json(&value, registry)?;
            updated.id = current.id;
            current = updated;
        }
        Ok(current)
    }

    #[instrument(skip(self))]
    fn list_scripts(&self, event: &str) -> Result<Vec<PathBuf>> {
        if !self.hooks_dir.exists() {
            return Ok(Vec::new());
        }

        let mut scripts = Vec::new();
        for entry in fs::read_dir(&self.hooks_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !name.starts_with(&format!("{event}.")) {
                continue;
            }

            if !is_executable(&path)? {
                debug!(path = %path.display(), "skipping non-executable hook");
                continue;
            }

            debug!(event, path = %path.display(), "selected hook script");
            scripts.push(path);
        }

        scripts.sort();
        Ok(scripts)
    }
}

fn hook_error(path: &Path, reason: &str) -> Error {
    Error::Hook {
        script: path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown")
            .to_string(),
        reason: reason.to_string(),
    }
}

fn run_hook_no_io(path: &Path) -> Result<()> {
    info!(hook = %path.display(), "running hook");
    let output = Command::new(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    if !output.status.success() {
        return Err(hook_error(
            path,
            &format!(
                "exited with status {}",
                output
                    .status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        ));
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        warn!(hook = %path.display(), stderr = %stderr, "hook wrote stderr");
    }

    Ok(())
}

fn run_hook_with_json_lines(
    path: &Path,
    input_lines: &[String],
    expected_output_lines: usize,
) -> Result<Vec<String>> {
    info!(hook = %path.display(), "running hook");
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        for line in input_lines {
            writeln!(stdin, "{line}")?;
        }
    }

    let output = child.wait_with_output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            warn!(hook = %path.display(), stderr = %stderr, "hook failed");
        }
        return Err(hook_error(path, "exited nonzero"));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect();

    if lines.len() != expected_output_lines {
        return Err(hook_error(
            path,
            &format!(
                "expected {expected_output_lines} JSON task line(s), found {}",
                lines.len()
            ),
        ));
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        warn!(hook = %path.display(), stderr = %stderr, "hook wrote stderr");
    }

    Ok(lines)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode();
    Ok(mode & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> Result<bool> {
    Ok(path.is_file())
}
