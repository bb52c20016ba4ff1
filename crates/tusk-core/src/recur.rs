use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{Status, Task};

/// Upper bound on generated children per parent per pass; a runaway
/// recurrence period should not flood the store.
const EXPANSION_CAP: i64 = 1000;

/// Mask characters recording each child's lifecycle on the parent.
pub const MASK_PENDING: char = '-';
pub const MASK_COMPLETED: char = '+';
pub const MASK_DELETED: char = 'X';
pub const MASK_WAITING: char = 'W';

/// Generate the pending children every recurring parent is due, out to
/// `recurrence.limit` periods past now. Runs before any command that reads
/// the store, under the same gc gate.
#[instrument(skip(store, cfg, now))]
pub fn expand(store: &mut TaskStore, cfg: &Config, now: DateTime<Utc>) -> Result<usize> {
    let limit = cfg.get_int("recurrence.limit").unwrap_or(1).max(0);

    let parents: Vec<Task> = store
        .pending_tasks()
        .iter()
        .filter(|t| t.status() == Status::Recurring)
        .cloned()
        .collect();

    let mut created = 0;
    for parent in parents {
        let Some(due) = parent.get_date("due") else {
            warn!(uuid = parent.uuid(), "recurring task without a due date; skipping");
            continue;
        };
        let Some(recur) = parent.get_duration("recur") else {
            warn!(uuid = parent.uuid(), "recurring task without a period; skipping");
            continue;
        };
        if recur.seconds() <= 0 {
            continue;
        }

        let horizon = now + chrono::Duration::seconds(limit * recur.seconds());
        let until = parent.get_date("until");

        let mut mask: Vec<char> = parent.get("mask").unwrap_or("").chars().collect();
        let mut mask_changed = false;

        let mut index: i64 = 0;
        while index < EXPANSION_CAP {
            let child_due = due + chrono::Duration::seconds(index * recur.seconds());
            if child_due > horizon {
                break;
            }
            if let Some(until) = until
                && child_due > until
            {
                break;
            }

            while mask.len() <= index as usize {
                mask.push(MASK_PENDING);
                mask_changed = true;
            }

            let slot = mask[index as usize];
            if slot == MASK_PENDING && !child_exists(store, parent.uuid(), index) {
                let child = synthesize_child(&parent, index, child_due, now);
                debug!(
                    parent = parent.uuid(),
                    imask = index,
                    due = child_due.timestamp(),
                    "generating recurrence child"
                );
                store.add(child, now)?;
                created += 1;
            }

            index += 1;
        }

        if mask_changed {
            let mut updated = store
                .get_by_uuid(parent.uuid())
                .unwrap_or_else(|| parent.clone());
            updated.set("mask", mask.iter().collect::<String>());
            store.modify(updated, now)?;
        }
    }

    Ok(created)
}

fn child_exists(store: &TaskStore, parent_uuid: &str, index: i64) -> bool {
    store.all_tasks().any(|t| {
        t.get("parent") == Some(parent_uuid)
            && t.get("imask")
                .and_then(|i| i.parse::<i64>().ok())
                .map(|i| i == index)
                .unwrap_or(false)
    })
}

/// A child copies the parent except for identity, status, its own due date,
/// and the parent/imask back-references.
fn synthesize_child(parent: &Task, index: i64, due: DateTime<Utc>, now: DateTime<Utc>) -> Task {
    let mut child = parent.clone();
    child.set("uuid", Uuid::new_v4().to_string());
    child.set_status(Status::Pending);
    child.set_date("due", due);
    child.set_date("entry", now);
    child.set("parent", parent.uuid());
    child.set("imask", index.to_string());
    child.remove("mask");
    child.remove("modified");
    child
}

/// Record a child's lifecycle change on its parent's mask. Called when a
/// generated child completes, is deleted, or starts waiting.
#[instrument(skip(store, child, now))]
pub fn update_parent_mask(
    store: &mut TaskStore,
    child: &Task,
    state: char,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(parent_uuid) = child.get("parent") else {
        return Ok(());
    };
    let Some(index) = child.get("imask").and_then(|i| i.parse::<usize>().ok()) else {
        return Ok(());
    };
    let Some(mut parent) = store.get_by_uuid(parent_uuid) else {
        return Ok(());
    };

    let mut mask: Vec<char> = parent.get("mask").unwrap_or("").chars().collect();
    while mask.len() <= index {
        mask.push(MASK_PENDING);
    }
    if mask[index] == state {
        return Ok(());
    }
    mask[index] = state;
    parent.set("mask", mask.iter().collect::<String>());
    store.modify(parent, now)?;
    Ok(())
}
