use std::collections::HashSet;

use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::store::{TaskStore, UndoTransaction, parse_undo_lines};
use crate::task::Task;

/// What a merge did, for the caller to report and to decide whether an
/// autopush is worthwhile.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Remote transactions were applied locally.
    pub remote_changes: bool,
    /// Local transactions exist that the remote has not seen.
    pub local_changes: bool,
    pub messages: Vec<String>,
}

impl MergeOutcome {
    pub fn up_to_date(&self) -> bool {
        !self.remote_changes && !self.local_changes
    }
}

/// Reconcile the local store with a remote undo log.
///
/// The shared history is the longest common prefix of whole transactions;
/// past it, per-uuid conflicts resolve by timestamp, newest wins, ties to
/// the local side. Right-side transactions that lose still enter the local
/// undo history so both replicas converge on the same log.
#[instrument(skip(store, remote_lines))]
pub fn merge(store: &mut TaskStore, remote_lines: &[String]) -> Result<MergeOutcome> {
    let local_lines = store.read_undo_lines()?;
    let local_all = parse_undo_lines(&local_lines)?;
    let remote_all = parse_undo_lines(remote_lines)?;

    let prefix = common_prefix(&local_all, &remote_all);
    let mut lmods: Vec<UndoTransaction> = local_all[prefix..].to_vec();
    let rmods_raw: Vec<UndoTransaction> = remote_all[prefix..].to_vec();

    let mut outcome = MergeOutcome {
        remote_changes: false,
        local_changes: !lmods.is_empty(),
        messages: Vec::new(),
    };

    if rmods_raw.is_empty() {
        info!(
            local_ahead = lmods.len(),
            "remote branch has nothing new; merge is a no-op"
        );
        return Ok(outcome);
    }

    // Classify uuids created since the branch point.
    let uuid_left: HashSet<String> = lmods
        .iter()
        .filter(|t| t.is_creation())
        .map(|t| t.uuid().to_string())
        .collect();

    let mut uuid_new: HashSet<String> = HashSet::new();
    // Transactions to apply locally, and losing right-side transactions
    // that only enter the history.
    let mut mods: Vec<UndoTransaction> = Vec::new();
    let mut mods_history: Vec<UndoTransaction> = Vec::new();
    let mut rmods: Vec<UndoTransaction> = Vec::new();

    for tmod in rmods_raw {
        let uuid = tmod.uuid().to_string();
        if uuid_left.contains(&uuid) {
            // Created independently on both sides: the remote line of
            // history for this uuid is discarded wholesale.
            outcome
                .messages
                .push(format!("Rejected simultaneous creation of {uuid}"));
            continue;
        }
        if tmod.is_creation() {
            outcome
                .messages
                .push(format!("Adding new remote task {uuid}"));
            uuid_new.insert(uuid);
            mods.push(tmod);
        } else if uuid_new.contains(&uuid) {
            mods.push(tmod);
        } else {
            rmods.push(tmod);
        }
    }

    // Walk local modifications newest-first, resolving against the
    // remaining remote modifications per uuid.
    let mut merged_uuids = uuid_left.clone();
    let mut lmods_changed = false;
    for l_idx in (0..lmods.len()).rev() {
        let tmod_l = lmods[l_idx].clone();
        let uuid = tmod_l.uuid().to_string();
        if merged_uuids.contains(&uuid) {
            continue;
        }

        let mut rwin = false;
        let mut lwin = false;
        let mut r_idx = rmods.len();
        while r_idx > 0 {
            r_idx -= 1;
            if rmods[r_idx].uuid() != uuid {
                continue;
            }
            let tmod_r = rmods.remove(r_idx);

            if rwin {
                // The right side already won; keep collecting its older
                // transactions that are still newer than the local one.
                if tmod_r.time > tmod_l.time {
                    mods.insert(0, tmod_r);
                }
            } else if lwin {
                // The left side won; right-side history is preserved but
                // not applied.
                mods_history.insert(0, tmod_r);
            } else if tmod_r.time > tmod_l.time {
                outcome
                    .messages
                    .push(format!("Applying newer remote change to {uuid}"));
                mods.insert(0, tmod_r);
                rwin = true;
            } else {
                outcome
                    .messages
                    .push(format!("Keeping newer local change to {uuid}"));

                // The newest local transaction for this uuid is stitched so
                // the undo chain replays over the absorbed remote change.
                let newest_local = lmods
                    .iter()
                    .rposition(|t| t.uuid() == uuid)
                    .unwrap_or(l_idx);
                if tmod_l.time > tmod_r.time {
                    lmods[newest_local].old = Some(tmod_r.new.clone());
                    lmods.push(tmod_r);
                    lmods_changed = true;
                } else {
                    // Equal timestamps: the local change wins and the remote
                    // twin is dropped; stitch to the next older remote
                    // transaction on this uuid if one exists.
                    if let Some(older) = rmods.iter().rev().find(|t| t.uuid() == uuid) {
                        lmods[newest_local].old = Some(older.new.clone());
                        lmods_changed = true;
                    }
                }
                merged_uuids.insert(uuid.clone());
                lwin = true;
            }
        }

        if rwin {
            // Stitch the oldest winning remote transaction onto the local
            // endpoint so history replays.
            if let Some(front) = mods.first_mut() {
                front.old = Some(tmod_l.new.clone());
            }
        }
    }

    // Non-conflicting remote changes apply as-is.
    let mut remaining = rmods;
    remaining.extend(mods);
    let mut mods = remaining;
    mods.sort_by_key(|t| t.time);
    mods_history.sort_by_key(|t| t.time);

    if mods.is_empty() && !lmods_changed && mods_history.is_empty() {
        info!("no remote transactions to absorb; store is up to date");
        return Ok(outcome);
    }

    // Apply the chosen transactions to pending / completed.
    let mut pending: Vec<Task> = store.pending_tasks().to_vec();
    let mut completed: Vec<Task> = store.completed_tasks().to_vec();
    let mut applied: Vec<UndoTransaction> = Vec::new();

    if !mods.is_empty() {
        outcome.remote_changes = true;

        for tmod in mods {
            let uuid = tmod.uuid().to_string();
            if tmod.is_creation() {
                if pending.iter().any(|t| t.uuid() == uuid)
                    || completed.iter().any(|t| t.uuid() == uuid)
                {
                    debug!(uuid = %uuid, "duplicate creation dropped");
                    continue;
                }
                pending.push(tmod.new.clone());
                applied.push(tmod);
                continue;
            }

            let before_completed = tmod
                .old
                .as_ref()
                .map(|t| !t.status().is_pending_file())
                .unwrap_or(false);
            let after_completed = !tmod.new.status().is_pending_file();

            let (source, target) = if before_completed {
                (&mut completed, &mut pending)
            } else {
                (&mut pending, &mut completed)
            };

            match source.iter().position(|t| t.uuid() == uuid) {
                Some(idx) => {
                    if before_completed != after_completed {
                        source.remove(idx);
                        target.push(tmod.new.clone());
                    } else {
                        source[idx] = tmod.new.clone();
                    }
                    applied.push(tmod);
                }
                None => {
                    outcome.messages.push(format!(
                        "Cannot apply remote change to missing task {uuid}"
                    ));
                }
            }
        }

    }

    // Propagate the merged state on the next push.
    for tmod in &applied {
        store.append_backlog(tmod.new.compose_json(store.registry(), false).to_string());
    }

    // Rewrite undo: shared prefix plus all surviving transactions in
    // timestamp order.
    let mut merged: Vec<UndoTransaction> = Vec::new();
    merged.extend(applied);
    merged.extend(lmods);
    merged.extend(mods_history);
    merged.sort_by_key(|t| t.time);

    let mut undo_lines: Vec<String> = Vec::new();
    for txn in &local_all[..prefix] {
        undo_lines.extend(txn.to_lines());
    }
    for txn in &merged {
        undo_lines.extend(txn.to_lines());
    }

    store.replace_all(pending, completed, undo_lines);
    Ok(outcome)
}

fn common_prefix(left: &[UndoTransaction], right: &[UndoTransaction]) -> usize {
    let mut idx = 0;
    while idx < left.len() && idx < right.len() && left[idx] == right[idx] {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::merge;
    use crate::config::Config;
    use crate::store::TaskStore;
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

    fn undo_creation(time: i64, task: &Task) -> Vec<String> {
        vec![
            format!("time {time}"),
            format!("new {}", task.compose_ff4()),
            "---".to_string(),
        ]
    }

    fn undo_modification(time: i64, old: &Task, new: &Task) -> Vec<String> {
        vec![
            format!("time {time}"),
            format!("old {}", old.compose_ff4()),
            format!("new {}", new.compose_ff4()),
            "---".to_string(),
        ]
    }

    #[test]
    fn merge_with_self_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        store
            .add(make_task("11111111-0000-4000-8000-000000000001", "one"), now)
            .expect("add");
        store.commit(now).expect("commit");

        let own = store.read_undo_lines().expect("undo lines");
        let outcome = merge(&mut store, &own).expect("merge");
        assert!(outcome.up_to_date());
    }

    #[test]
    fn new_remote_tasks_are_added() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        store
            .add(make_task("11111111-0000-4000-8000-000000000001", "local"), now)
            .expect("add");
        store.commit(now).expect("commit");

        // The remote log shares the creation, then adds its own task.
        let mut remote = store.read_undo_lines().expect("undo");
        let remote_task = make_task("22222222-0000-4000-8000-000000000002", "remote");
        remote.extend(undo_creation(now.timestamp() + 10, &remote_task));

        let outcome = merge(&mut store, &remote).expect("merge");
        assert!(outcome.remote_changes);
        store.commit(now).expect("commit merge");

        assert!(store.get_by_uuid("22222222-0000-4000-8000-000000000002").is_some());
        assert_eq!(store.pending_tasks().len(), 2);

        // Re-merging the same remote log converges: nothing more to apply.
        let outcome = merge(&mut store, &remote).expect("second merge");
        assert!(!outcome.remote_changes);
    }

    #[test]
    fn newer_remote_modification_wins() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        let base = make_task("11111111-0000-4000-8000-000000000001", "shared");
        store.add(base.clone(), now).expect("add");
        store.commit(now).expect("commit");
        let shared = store.read_undo_lines().expect("undo");

        // Local edit at t+10.
        let mut local_edit = store.get_by_uuid(base.uuid()).expect("get");
        local_edit.set("priority", "L");
        store
            .modify(local_edit, now + chrono::Duration::seconds(10))
            .expect("modify");
        store.commit(now + chrono::Duration::seconds(10)).expect("commit");

        // Remote edit at t+100 on the shared base.
        let mut remote_after = base.clone();
        remote_after.set("priority", "H");
        remote_after.set("modified", (now.timestamp() + 100).to_string());
        let mut remote = shared.clone();
        remote.extend(undo_modification(now.timestamp() + 100, &base, &remote_after));

        let outcome = merge(&mut store, &remote).expect("merge");
        assert!(outcome.remote_changes);

        let merged = store.get_by_uuid(base.uuid()).expect("merged task");
        assert_eq!(merged.get("priority"), Some("H"));
    }

    #[test]
    fn newer_local_modification_survives() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        let base = make_task("11111111-0000-4000-8000-000000000001", "shared");
        store.add(base.clone(), now).expect("add");
        store.commit(now).expect("commit");
        let shared = store.read_undo_lines().expect("undo");

        // Local edit at t+100 (newer).
        let mut local_edit = store.get_by_uuid(base.uuid()).expect("get");
        local_edit.set("priority", "L");
        store
            .modify(local_edit, now + chrono::Duration::seconds(100))
            .expect("modify");
        store.commit(now + chrono::Duration::seconds(100)).expect("commit");

        // Remote edit at t+10 (older).
        let mut remote_after = base.clone();
        remote_after.set("priority", "H");
        let mut remote = shared.clone();
        remote.extend(undo_modification(now.timestamp() + 10, &base, &remote_after));

        merge(&mut store, &remote).expect("merge");

        let merged = store.get_by_uuid(base.uuid()).expect("merged task");
        assert_eq!(merged.get("priority"), Some("L"));
    }

    #[test]
    fn simultaneous_creations_prefer_local() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        let local = make_task("33333333-0000-4000-8000-000000000003", "local version");
        store.add(local, now).expect("add");
        store.commit(now).expect("commit");

        // Remote created the same uuid with different content.
        let remote_task = make_task("33333333-0000-4000-8000-000000000003", "remote version");
        let remote = undo_creation(now.timestamp() + 5, &remote_task);

        let outcome = merge(&mut store, &remote).expect("merge");
        assert!(!outcome.remote_changes);

        let kept = store
            .get_by_uuid("33333333-0000-4000-8000-000000000003")
            .expect("kept");
        assert_eq!(kept.description(), "local version");
    }

    #[test]
    fn status_change_moves_between_files() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let mut store = TaskStore::open(dir.path(), registry(), false).expect("open");
        let base = make_task("11111111-0000-4000-8000-000000000001", "to finish");
        store.add(base.clone(), now).expect("add");
        store.commit(now).expect("commit");
        let shared = store.read_undo_lines().expect("undo");

        // Remote completed the task.
        let mut done = base.clone();
        done.set_status(Status::Completed);
        done.set("end", (now.timestamp() + 50).to_string());
        let mut remote = shared.clone();
        remote.extend(undo_modification(now.timestamp() + 50, &base, &done));

        merge(&mut store, &remote).expect("merge");
        store.commit(now).expect("commit");

        assert!(store.pending_tasks().is_empty());
        assert_eq!(store.completed_tasks().len(), 1);
        assert_eq!(store.completed_tasks()[0].status(), Status::Completed);
    }
}
