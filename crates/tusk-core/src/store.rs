use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt as _;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::dom::DomSource;
use crate::error::{Error, Result};
use crate::task::{AttributeRegistry, Status, Task};

pub const PENDING_DATA: &str = "pending.data";
pub const COMPLETED_DATA: &str = "completed.data";
pub const UNDO_DATA: &str = "undo.data";
pub const BACKLOG_DATA: &str = "backlog.data";

/// One undo-log transaction: an optional before-image and an after-image.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoTransaction {
    pub time: i64,
    pub old: Option<Task>,
    pub new: Task,
}

impl UndoTransaction {
    pub fn uuid(&self) -> &str {
        self.new.uuid()
    }

    pub fn is_creation(&self) -> bool {
        self.old.is_none()
    }

    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(4);
        lines.push(format!("time {}", self.time));
        if let Some(old) = &self.old {
            lines.push(format!("old {}", old.compose_ff4()));
        }
        lines.push(format!("new {}", self.new.compose_ff4()));
        lines.push("---".to_string());
        lines
    }
}

/// Parse a full undo log into transactions. `time` starts a transaction,
/// `new` completes it, `---` separates.
pub fn parse_undo_lines(lines: &[String]) -> Result<Vec<UndoTransaction>> {
    let mut out = Vec::new();
    let mut time: Option<i64> = None;
    let mut old: Option<Task> = None;

    for line in lines {
        if let Some(stamp) = line.strip_prefix("time ") {
            time = Some(
                stamp
                    .trim()
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad undo timestamp: {line}")))?,
            );
            old = None;
        } else if let Some(record) = line.strip_prefix("old ") {
            old = Some(Task::parse_ff4(record)?);
        } else if let Some(record) = line.strip_prefix("new ") {
            let new = Task::parse_ff4(record)?;
            let time = time
                .ok_or_else(|| Error::Parse("undo transaction missing 'time' line".to_string()))?;
            out.push(UndoTransaction {
                time,
                old: old.take(),
                new,
            });
        }
        // "---" and blank lines carry no state.
    }

    Ok(out)
}

/// On-disk record format version. Only version 4 is readable; 3 is
/// recognized and refused, anything else is rejected outright.
pub fn record_version(line: &str) -> u8 {
    if line.starts_with('[') && line.contains("uuid:\"") {
        return 4;
    }
    let bytes = line.as_bytes();
    if bytes.len() > 37 {
        let looks_uuid = bytes[..36]
            .iter()
            .enumerate()
            .all(|(i, c)| match i {
                8 | 13 | 18 | 23 => *c == b'-',
                _ => c.is_ascii_hexdigit(),
            });
        if looks_uuid && bytes[36] == b' ' {
            return 3;
        }
    }
    0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirtyState {
    Clean,
    /// Only new records were appended; count of clean prefix records.
    Appended { clean: usize },
    Rewrite,
}

/// The task database: pending, completed, undo and backlog files under one
/// data directory. The store owns every persisted task; callers get copies
/// and write back through `modify`.
pub struct TaskStore {
    data_dir: PathBuf,
    registry: AttributeRegistry,
    pending: Vec<Task>,
    completed: Vec<Task>,
    pending_state: DirtyState,
    completed_state: DirtyState,
    /// (old, new) pairs; stamped with one timestamp at commit.
    undo_buffer: Vec<(Option<Task>, Task)>,
    backlog_buffer: Vec<String>,
    /// Whole-file undo/backlog contents when revert or merge rewrote them.
    undo_rewrite: Option<Vec<String>>,
    backlog_rewrite: Option<Vec<String>>,
    locks: Vec<File>,
}

impl TaskStore {
    #[instrument(skip(registry))]
    pub fn open(data_dir: &Path, registry: AttributeRegistry, locking: bool) -> Result<Self> {
        fs::create_dir_all(data_dir)?;

        let mut locks = Vec::new();
        for name in [PENDING_DATA, COMPLETED_DATA, UNDO_DATA, BACKLOG_DATA] {
            let path = data_dir.join(name);
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)?;
            if locking {
                file.lock_exclusive()?;
                locks.push(file);
            }
        }

        let pending = load_task_file(&data_dir.join(PENDING_DATA))?;
        let completed = load_task_file(&data_dir.join(COMPLETED_DATA))?;

        let mut store = Self {
            data_dir: data_dir.to_path_buf(),
            registry,
            pending,
            completed,
            pending_state: DirtyState::Clean,
            completed_state: DirtyState::Clean,
            undo_buffer: Vec::new(),
            backlog_buffer: Vec::new(),
            undo_rewrite: None,
            backlog_rewrite: None,
            locks,
        };
        store.assign_ids();

        info!(
            data_dir = %store.data_dir.display(),
            pending = store.pending.len(),
            completed = store.completed.len(),
            "opened task store"
        );
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    pub fn pending_tasks(&self) -> &[Task] {
        &self.pending
    }

    pub fn completed_tasks(&self) -> &[Task] {
        &self.completed
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.pending.iter().chain(self.completed.iter())
    }

    /// Ids are a per-run display convenience: pending-file order, 1-based;
    /// completed tasks stay at 0.
    fn assign_ids(&mut self) {
        for (idx, task) in self.pending.iter_mut().enumerate() {
            task.id = idx as u64 + 1;
        }
        for task in &mut self.completed {
            task.id = 0;
        }
    }

    pub fn get_by_id(&self, id: u64) -> Option<Task> {
        self.pending.iter().find(|t| t.id == id).cloned()
    }

    /// Full or partial (≥ 8 hex chars) uuid lookup across both files.
    pub fn get_by_uuid(&self, uuid: &str) -> Option<Task> {
        self.all_tasks()
            .find(|t| t.uuid() == uuid)
            .or_else(|| self.all_tasks().find(|t| t.uuid().starts_with(uuid)))
            .cloned()
    }

    #[instrument(skip(self, task, _now), fields(uuid = task.uuid()))]
    pub fn add(&mut self, task: Task, _now: DateTime<Utc>) -> Result<Task> {
        if task.uuid().is_empty() {
            return Err(Error::Validation("cannot add a task without a uuid".to_string()));
        }
        if self.all_tasks().any(|t| t.uuid() == task.uuid()) {
            return Err(Error::Conflict(task.uuid().to_string()));
        }
        self.ensure_no_cycle(&task)?;

        let mut task = task;
        let json = task.compose_json(&self.registry, false);

        if task.status().is_pending_file() {
            task.id = self.pending.len() as u64 + 1;
            self.pending.push(task.clone());
            if self.pending_state == DirtyState::Clean {
                self.pending_state = DirtyState::Appended {
                    clean: self.pending.len() - 1,
                };
            }
        } else {
            task.id = 0;
            self.completed.push(task.clone());
            if self.completed_state == DirtyState::Clean {
                self.completed_state = DirtyState::Appended {
                    clean: self.completed.len() - 1,
                };
            }
        }

        self.undo_buffer.push((None, task.clone()));
        self.backlog_buffer.push(json.to_string());

        debug!(id = task.id, "task added");
        Ok(task)
    }

    #[instrument(skip(self, task, now), fields(uuid = task.uuid()))]
    pub fn modify(&mut self, task: Task, now: DateTime<Utc>) -> Result<Task> {
        let uuid = task.uuid().to_string();
        let prior = self
            .all_tasks()
            .find(|t| t.uuid() == uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(uuid.clone()))?;

        if prior == task {
            return Err(Error::Validation(format!(
                "task {uuid} unchanged; nothing to modify"
            )));
        }
        self.ensure_no_cycle(&task)?;

        let mut task = task;
        task.set_date("modified", now);

        // Overwrite in place; gc later moves misfiled records.
        let mut replaced = false;
        for slot in self.pending.iter_mut() {
            if slot.uuid() == uuid {
                task.id = slot.id;
                *slot = task.clone();
                self.pending_state = DirtyState::Rewrite;
                replaced = true;
                break;
            }
        }
        if !replaced {
            for slot in self.completed.iter_mut() {
                if slot.uuid() == uuid {
                    task.id = 0;
                    *slot = task.clone();
                    self.completed_state = DirtyState::Rewrite;
                    replaced = true;
                    break;
                }
            }
        }
        if !replaced {
            return Err(Error::NotFound(uuid));
        }

        self.undo_buffer.push((Some(prior), task.clone()));
        self.backlog_buffer
            .push(task.compose_json(&self.registry, false).to_string());

        Ok(task)
    }

    /// Reject a dependency set that loops back to the task itself,
    /// breadth-first from the mutated task.
    pub fn ensure_no_cycle(&self, task: &Task) -> Result<()> {
        let target = task.uuid();
        if target.is_empty() {
            return Ok(());
        }

        let mut queue: Vec<String> = task.depends();
        if queue.iter().any(|d| d == target) {
            return Err(Error::Validation(format!(
                "task {target} cannot depend on itself"
            )));
        }

        let mut seen: Vec<String> = Vec::new();
        while let Some(next) = queue.pop() {
            if seen.contains(&next) {
                continue;
            }
            seen.push(next.clone());
            if let Some(dep) = self.all_tasks().find(|t| t.uuid() == next) {
                for transitive in dep.depends() {
                    if transitive == target {
                        return Err(Error::Validation(format!(
                            "dependency on {next} would create a cycle"
                        )));
                    }
                    queue.push(transitive);
                }
            }
        }
        Ok(())
    }

    /// Flush every dirty file. Append-only when possible, truncate-and-
    /// rewrite otherwise; delivery signals are masked for the duration so a
    /// transaction never lands half-written.
    #[instrument(skip(self, now))]
    pub fn commit(&mut self, now: DateTime<Utc>) -> Result<()> {
        let _guard = signals::MaskGuard::engage();

        match self.pending_state {
            DirtyState::Clean => {}
            DirtyState::Appended { clean } => {
                append_task_file(&self.data_dir.join(PENDING_DATA), &self.pending[clean..])?;
            }
            DirtyState::Rewrite => {
                rewrite_task_file(&self.data_dir.join(PENDING_DATA), &self.pending)?;
            }
        }
        self.pending_state = DirtyState::Clean;

        match self.completed_state {
            DirtyState::Clean => {}
            DirtyState::Appended { clean } => {
                append_task_file(
                    &self.data_dir.join(COMPLETED_DATA),
                    &self.completed[clean..],
                )?;
            }
            DirtyState::Rewrite => {
                rewrite_task_file(&self.data_dir.join(COMPLETED_DATA), &self.completed)?;
            }
        }
        self.completed_state = DirtyState::Clean;

        if let Some(lines) = self.undo_rewrite.take() {
            rewrite_lines(&self.data_dir.join(UNDO_DATA), &lines)?;
        }
        if !self.undo_buffer.is_empty() {
            // Every transaction in one commit bears the same timestamp.
            let stamp = now.timestamp();
            let mut lines = Vec::new();
            for (old, new) in self.undo_buffer.drain(..) {
                lines.extend(
                    UndoTransaction {
                        time: stamp,
                        old,
                        new,
                    }
                    .to_lines(),
                );
            }
            append_lines(&self.data_dir.join(UNDO_DATA), &lines)?;
        }

        if let Some(lines) = self.backlog_rewrite.take() {
            rewrite_lines(&self.data_dir.join(BACKLOG_DATA), &lines)?;
        }
        if !self.backlog_buffer.is_empty() {
            let lines: Vec<String> = self.backlog_buffer.drain(..).collect();
            append_lines(&self.data_dir.join(BACKLOG_DATA), &lines)?;
        }

        debug!("commit complete");
        Ok(())
    }

    pub fn read_undo_lines(&self) -> Result<Vec<String>> {
        read_lines(&self.data_dir.join(UNDO_DATA))
    }

    pub fn last_transaction(&self) -> Result<Option<UndoTransaction>> {
        let lines = self.read_undo_lines()?;
        Ok(parse_undo_lines(&lines)?.into_iter().last())
    }

    /// Undo the most recent transaction: restore the prior record across
    /// pending / completed / backlog and pop the undo entry. The six shapes:
    /// creation into either file (remove), move between files (move back),
    /// and in-place change in either file (overwrite).
    #[instrument(skip(self))]
    pub fn revert(&mut self) -> Result<UndoTransaction> {
        let lines = self.read_undo_lines()?;
        let mut transactions = parse_undo_lines(&lines)?;
        let last = transactions
            .pop()
            .ok_or_else(|| Error::Validation("no undoable transactions".to_string()))?;

        let uuid = last.uuid().to_string();

        let pending_slot = self.pending.iter().position(|t| t.uuid() == uuid);
        let completed_slot = self.completed.iter().position(|t| t.uuid() == uuid);
        self.pending.retain(|t| t.uuid() != uuid);
        self.completed.retain(|t| t.uuid() != uuid);

        // The prior record goes back where the current one sat, keeping
        // line order and therefore id assignment stable.
        if let Some(prior) = &last.old {
            if prior.status().is_pending_file() {
                let at = pending_slot.unwrap_or(self.pending.len());
                self.pending.insert(at.min(self.pending.len()), prior.clone());
            } else {
                let at = completed_slot.unwrap_or(self.completed.len());
                self.completed.insert(at.min(self.completed.len()), prior.clone());
            }
        }
        self.pending_state = DirtyState::Rewrite;
        self.completed_state = DirtyState::Rewrite;
        self.assign_ids();

        // Drop the backlog line the reverted transaction appended, restoring
        // the file to its pre-transaction bytes.
        let mut backlog = read_lines(&self.data_dir.join(BACKLOG_DATA))?;
        if let Some(idx) = backlog
            .iter()
            .rposition(|line| line.contains(&format!("\"uuid\":\"{uuid}\"")))
        {
            backlog.remove(idx);
        }
        self.backlog_rewrite = Some(backlog);

        let remaining: Vec<String> = transactions.iter().flat_map(|t| t.to_lines()).collect();
        self.undo_rewrite = Some(remaining);

        info!(uuid = %uuid, "reverted last transaction");
        Ok(last)
    }

    /// Garbage collection: shepherd records into the file their status
    /// demands, wake overdue waiting tasks, renumber ids.
    #[instrument(skip(self, now))]
    pub fn gc(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut moved = 0;

        let mut keep_pending = Vec::with_capacity(self.pending.len());
        for mut task in std::mem::take(&mut self.pending) {
            if task.status() == Status::Waiting
                && task.get_date("wait").map(|w| w <= now).unwrap_or(true)
            {
                task.remove("wait");
                task.set_status(Status::Pending);
                moved += 1;
            }
            if task.status().is_pending_file() {
                keep_pending.push(task);
            } else {
                self.completed.push(task);
                moved += 1;
            }
        }
        self.pending = keep_pending;

        let mut keep_completed = Vec::with_capacity(self.completed.len());
        for task in std::mem::take(&mut self.completed) {
            if matches!(task.status(), Status::Pending | Status::Recurring) {
                self.pending.push(task);
                moved += 1;
            } else {
                keep_completed.push(task);
            }
        }
        self.completed = keep_completed;

        if moved > 0 {
            self.pending_state = DirtyState::Rewrite;
            self.completed_state = DirtyState::Rewrite;
        }
        self.assign_ids();

        if moved > 0 {
            debug!(moved, "gc moved records");
        }
        Ok(moved)
    }

    /// Replace the store's entire contents; the merge writes through this.
    pub fn replace_all(
        &mut self,
        pending: Vec<Task>,
        completed: Vec<Task>,
        undo_lines: Vec<String>,
    ) {
        self.pending = pending;
        self.completed = completed;
        self.pending_state = DirtyState::Rewrite;
        self.completed_state = DirtyState::Rewrite;
        self.undo_rewrite = Some(undo_lines);
        self.assign_ids();
    }

    pub fn append_backlog(&mut self, line: String) {
        self.backlog_buffer.push(line);
    }
}

impl Drop for TaskStore {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        while let Some(file) = self.locks.pop() {
            if let Err(err) = fs2::FileExt::unlock(&file) {
                warn!(error = %err, "failed to release file lock");
            }
        }
    }
}

impl DomSource for TaskStore {
    fn task_by_id(&self, id: u64) -> Option<Task> {
        self.get_by_id(id)
    }

    fn task_by_uuid(&self, uuid: &str) -> Option<Task> {
        self.get_by_uuid(uuid)
    }

    fn is_blocked(&self, task: &Task) -> bool {
        task.depends().iter().any(|dep| {
            self.all_tasks()
                .find(|t| t.uuid() == *dep)
                .map(|t| t.status().is_pending_file())
                .unwrap_or(false)
        })
    }

    fn is_blocking(&self, task: &Task) -> bool {
        let uuid = task.uuid();
        !uuid.is_empty()
            && self.pending.iter().any(|other| {
                other.status().is_pending_file() && other.depends().iter().any(|d| d == uuid)
            })
    }
}

fn load_task_file(path: &Path) -> Result<Vec<Task>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match record_version(&line) {
            4 => out.push(Task::parse_ff4(&line)?),
            3 => {
                return Err(Error::Parse(format!(
                    "{}:{} is a version 3 record; this store reads version 4 only",
                    path.display(),
                    idx + 1
                )));
            }
            _ => {
                return Err(Error::Parse(format!(
                    "{}:{} is not a recognized task record",
                    path.display(),
                    idx + 1
                )));
            }
        }
    }
    Ok(out)
}

fn append_task_file(path: &Path, tasks: &[Task]) -> Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    for task in tasks {
        writeln!(file, "{}", task.compose_ff4())?;
    }
    file.flush()?;
    Ok(())
}

fn rewrite_task_file(path: &Path, tasks: &[Task]) -> Result<()> {
    let lines: Vec<String> = tasks.iter().map(Task::compose_ff4).collect();
    rewrite_lines(path, &lines)
}

fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()?;
    Ok(())
}

fn rewrite_lines(path: &Path, lines: &[String]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for line in lines {
        writeln!(temp, "{line}")?;
    }
    temp.flush()?;
    temp.persist(path)
        .map_err(|err| Error::Io(err.error))?;
    Ok(())
}

pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        out.push(line?);
    }
    Ok(out)
}

mod signals {
    //! Mask delivery signals while commit writes, so one transaction is
    //! never torn by ^C.

    #[cfg(unix)]
    pub struct MaskGuard {
        previous: nix::sys::signal::SigSet,
    }

    #[cfg(unix)]
    impl MaskGuard {
        pub fn engage() -> Option<Self> {
            use nix::sys::signal::{SigSet, Signal, sigprocmask, SigmaskHow};

            let mut mask = SigSet::empty();
            for signal in [
                Signal::SIGHUP,
                Signal::SIGINT,
                Signal::SIGPIPE,
                Signal::SIGTERM,
                Signal::SIGUSR1,
                Signal::SIGUSR2,
            ] {
                mask.add(signal);
            }

            let mut previous = SigSet::empty();
            sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut previous)).ok()?;
            Some(Self { previous })
        }
    }

    #[cfg(unix)]
    impl Drop for MaskGuard {
        fn drop(&mut self) {
            use nix::sys::signal::{sigprocmask, SigmaskHow};
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
        }
    }

    #[cfg(not(unix))]
    pub struct MaskGuard;

    #[cfg(not(unix))]
    impl MaskGuard {
        pub fn engage() -> Option<Self> {
            Some(Self)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::{TaskStore, parse_undo_lines, record_version};
    use crate::config::Config;
    use crate::dom::DomSource as _;
    use crate::task::{AttributeRegistry, Status, Task};

    fn fixed_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 18, 12, 0, 0).unwrap()
    }

    fn registry() -> AttributeRegistry {
        AttributeRegistry::from_config(&Config::defaults())
    }

    fn make_task(uuid: &str, description: &str) -> Task {
        let mut task = Task::new();
        task.set("uuid", uuid);
        task.set("description", description);
        task.set_status(Status::Pending);
        task.set("entry", fixed_now().timestamp().to_string());
        task
    }

    #[test]
    fn add_commit_reload() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();

        {
            let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
            store
                .add(make_task("11111111-0000-4000-8000-000000000001", "first"), now)
                .expect("add");
            store
                .add(make_task("11111111-0000-4000-8000-000000000002", "second"), now)
                .expect("add");
            store.commit(now).expect("commit");
        }

        let store = TaskStore::open(dir.path(), registry(), false).expect("reopen");
        assert_eq!(store.pending_tasks().len(), 2);
        assert_eq!(store.pending_tasks()[0].id, 1);
        assert_eq!(store.pending_tasks()[1].id, 2);
        assert_eq!(store.pending_tasks()[0].description(), "first");
    }

    #[test]
    fn duplicate_uuid_is_a_conflict() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        store
            .add(make_task("11111111-0000-4000-8000-000000000001", "first"), now)
            .expect("add");
        let err = store
            .add(make_task("11111111-0000-4000-8000-000000000001", "again"), now)
            .expect_err("duplicate add must fail");
        assert!(matches!(err, crate::error::Error::Conflict(_)));
    }

    #[test]
    fn modify_requires_change_and_sets_modified() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        let task = store
            .add(make_task("11111111-0000-4000-8000-000000000001", "first"), now)
            .expect("add");

        let unchanged = store.modify(task.clone(), now);
        assert!(unchanged.is_err());

        let mut changed = task.clone();
        changed.set("project", "inbox");
        let saved = store.modify(changed, now).expect("modify");
        assert_eq!(saved.get_date("modified"), Some(now));
    }

    #[test]
    fn undo_log_round_trip() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        let task = store
            .add(make_task("11111111-0000-4000-8000-000000000001", "first"), now)
            .expect("add");
        let mut changed = task.clone();
        changed.set("project", "inbox");
        store.modify(changed, now).expect("modify");
        store.commit(now).expect("commit");

        let lines = store.read_undo_lines().expect("read undo");
        let transactions = parse_undo_lines(&lines).expect("parse undo");
        assert_eq!(transactions.len(), 2);
        assert!(transactions[0].is_creation());
        assert!(!transactions[1].is_creation());
        assert_eq!(transactions[1].old.as_ref().map(|t| t.description()), Some("first"));
    }

    #[test]
    fn revert_restores_prior_bytes() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        let task = store
            .add(make_task("11111111-0000-4000-8000-000000000001", "first"), now)
            .expect("add");
        store.commit(now).expect("commit add");

        let pending_before = std::fs::read_to_string(dir.path().join(super::PENDING_DATA))
            .expect("read pending");
        let backlog_before = std::fs::read_to_string(dir.path().join(super::BACKLOG_DATA))
            .expect("read backlog");

        let mut changed = task.clone();
        changed.set("priority", "H");
        store.modify(changed, now).expect("modify");
        store.commit(now).expect("commit modify");

        store.revert().expect("revert");
        store.commit(now).expect("commit revert");

        let pending_after = std::fs::read_to_string(dir.path().join(super::PENDING_DATA))
            .expect("read pending after");
        let backlog_after = std::fs::read_to_string(dir.path().join(super::BACKLOG_DATA))
            .expect("read backlog after");
        assert_eq!(pending_before, pending_after);
        assert_eq!(backlog_before, backlog_after);
    }

    #[test]
    fn revert_of_creation_removes_the_task() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        store
            .add(make_task("11111111-0000-4000-8000-000000000001", "ephemeral"), now)
            .expect("add");
        store.commit(now).expect("commit");

        store.revert().expect("revert");
        store.commit(now).expect("commit revert");

        let store = TaskStore::open(dir.path(), registry(), false).expect("reopen");
        assert!(store.pending_tasks().is_empty());
    }

    #[test]
    fn gc_moves_records_and_wakes_waiting() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");

        let mut done = make_task("11111111-0000-4000-8000-000000000001", "done already");
        done.set_status(Status::Completed);
        // Simulate a done task still sitting in the pending file.
        store.pending.push(done);

        let mut waiting = make_task("11111111-0000-4000-8000-000000000002", "was waiting");
        waiting.set_status(Status::Waiting);
        waiting.set("wait", (now.timestamp() - 10).to_string());
        store.pending.push(waiting);

        let moved = store.gc(now).expect("gc");
        assert_eq!(moved, 2);
        assert_eq!(store.completed_tasks().len(), 1);
        assert_eq!(store.pending_tasks().len(), 1);
        assert_eq!(store.pending_tasks()[0].status(), Status::Pending);
        assert!(!store.pending_tasks()[0].has("wait"));
        assert_eq!(store.pending_tasks()[0].id, 1);

        // Idempotent: a second pass has nothing to do.
        assert_eq!(store.gc(now).expect("second gc"), 0);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");

        let a = make_task("11111111-0000-4000-8000-00000000000a", "a");
        let mut b = make_task("11111111-0000-4000-8000-00000000000b", "b");
        b.add_depend("11111111-0000-4000-8000-00000000000a");
        store.add(a.clone(), now).expect("add a");
        store.add(b, now).expect("add b");

        let mut a_cyclic = store
            .get_by_uuid("11111111-0000-4000-8000-00000000000a")
            .expect("get a");
        a_cyclic.add_depend("11111111-0000-4000-8000-00000000000b");
        let err = store.modify(a_cyclic, now).expect_err("cycle must be rejected");
        assert!(matches!(err, crate::error::Error::Validation(_)));
    }

    #[test]
    fn blocked_and_blocking() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");

        let a = make_task("11111111-0000-4000-8000-00000000000a", "a");
        let mut b = make_task("11111111-0000-4000-8000-00000000000b", "b");
        b.add_depend("11111111-0000-4000-8000-00000000000a");
        let a = store.add(a, now).expect("add a");
        let b = store.add(b, now).expect("add b");

        assert!(store.is_blocked(&b));
        assert!(store.is_blocking(&a));
        assert!(!store.is_blocked(&a));

        let mut a_done = a.clone();
        a_done.set_status(Status::Completed);
        a_done.set_date("end", now);
        store.modify(a_done, now).expect("complete a");
        store.gc(now).expect("gc");

        let b = store.get_by_uuid(b.uuid()).expect("b still present");
        assert!(!store.is_blocked(&b));
    }

    #[test]
    fn partial_uuid_lookup() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        store
            .add(make_task("deadbeef-0000-4000-8000-000000000001", "find me"), now)
            .expect("add");

        assert!(store.get_by_uuid("deadbeef").is_some());
        assert!(store.get_by_uuid("deadbeef-0000").is_some());
        assert!(store.get_by_uuid("cafebabe").is_none());
    }

    #[test]
    fn version_negotiation() {
        assert_eq!(
            record_version("[ uuid:\"x\" description:\"y\"]"),
            4
        );
        assert_eq!(
            record_version(
                "a0b1c2d3-0000-4000-8000-000000000000 - [] [] [] some old record"
            ),
            3
        );
        assert_eq!(record_version("garbage"), 0);
    }

    #[test]
    fn locking_blocks_second_opener() {
        let dir = tempdir().expect("tempdir");
        let _store = TaskStore::open(dir.path(), registry(), true).expect("open locked");

        // A second exclusive lock attempt on the same file must fail.
        let file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(dir.path().join(super::PENDING_DATA))
            .expect("open pending");
        assert!(fs2::FileExt::try_lock_exclusive(&file).is_err());
    }
}
