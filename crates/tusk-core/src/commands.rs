use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info, instrument};

use crate::cli::{Invocation, Limit, split_pair};
use crate::config::Config;
use crate::dates::{self, DateSettings};
use crate::dom::{DomContext, DomSource as _};
use crate::duration::Duration;
use crate::error::{Error, Result, Warnings};
use crate::expr::{self, EvalSettings};
use crate::hooks::HookRunner;
use crate::lexer::{Token, TokenKind};
use crate::merge;
use crate::recur;
use crate::render::Renderer;
use crate::store::{self, TaskStore};
use crate::task::{AttrType, AttributeRegistry, Status, Task};
use crate::urgency::{self, UrgencyInputs};

/// Static capability declarations: what a command accepts and what the
/// dispatcher must do around it.
#[derive(Debug, Clone, Copy)]
pub struct CommandDna {
    pub read_only: bool,
    pub displays_id: bool,
    pub needs_gc: bool,
    pub uses_context: bool,
    pub accepts_filter: bool,
    pub accepts_modifications: bool,
    pub accepts_miscellaneous: bool,
}

macro_rules! dna {
    ($ro:expr, $id:expr, $gc:expr, $ctx:expr, $f:expr, $m:expr, $x:expr) => {
        CommandDna {
            read_only: $ro,
            displays_id: $id,
            needs_gc: $gc,
            uses_context: $ctx,
            accepts_filter: $f,
            accepts_modifications: $m,
            accepts_miscellaneous: $x,
        }
    };
}

/// Every command, as a closed sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Add,
    Annotate,
    Append,
    Calendar,
    Context,
    Count,
    Delete,
    Denotate,
    Done,
    Duplicate,
    Export,
    Help,
    Ids,
    Import,
    Information,
    List,
    Log,
    Merge,
    Modify,
    Next,
    Prepend,
    Projects,
    Pull,
    Push,
    Show,
    Start,
    Stats,
    Stop,
    Tags,
    Undo,
    Uuids,
    Version,
}

impl CommandKind {
    pub const ALL: &'static [CommandKind] = &[
        CommandKind::Add,
        CommandKind::Annotate,
        CommandKind::Append,
        CommandKind::Calendar,
        CommandKind::Context,
        CommandKind::Count,
        CommandKind::Delete,
        CommandKind::Denotate,
        CommandKind::Done,
        CommandKind::Duplicate,
        CommandKind::Export,
        CommandKind::Help,
        CommandKind::Ids,
        CommandKind::Import,
        CommandKind::Information,
        CommandKind::List,
        CommandKind::Log,
        CommandKind::Merge,
        CommandKind::Modify,
        CommandKind::Next,
        CommandKind::Prepend,
        CommandKind::Projects,
        CommandKind::Pull,
        CommandKind::Push,
        CommandKind::Show,
        CommandKind::Start,
        CommandKind::Stats,
        CommandKind::Stop,
        CommandKind::Tags,
        CommandKind::Undo,
        CommandKind::Uuids,
        CommandKind::Version,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Add => "add",
            CommandKind::Annotate => "annotate",
            CommandKind::Append => "append",
            CommandKind::Calendar => "calendar",
            CommandKind::Context => "context",
            CommandKind::Count => "count",
            CommandKind::Delete => "delete",
            CommandKind::Denotate => "denotate",
            CommandKind::Done => "done",
            CommandKind::Duplicate => "duplicate",
            CommandKind::Export => "export",
            CommandKind::Help => "help",
            CommandKind::Ids => "ids",
            CommandKind::Import => "import",
            CommandKind::Information => "information",
            CommandKind::List => "list",
            CommandKind::Log => "log",
            CommandKind::Merge => "merge",
            CommandKind::Modify => "modify",
            CommandKind::Next => "next",
            CommandKind::Prepend => "prepend",
            CommandKind::Projects => "projects",
            CommandKind::Pull => "pull",
            CommandKind::Push => "push",
            CommandKind::Show => "show",
            CommandKind::Start => "start",
            CommandKind::Stats => "stats",
            CommandKind::Stop => "stop",
            CommandKind::Tags => "tags",
            CommandKind::Undo => "undo",
            CommandKind::Uuids => "uuids",
            CommandKind::Version => "version",
        }
    }

    pub fn dna(&self) -> CommandDna {
        match self {
            CommandKind::Add => dna!(false, true, false, false, false, true, false),
            CommandKind::Annotate => dna!(false, true, false, false, true, false, true),
            CommandKind::Append => dna!(false, true, false, false, true, false, true),
            CommandKind::Calendar => dna!(true, false, true, false, true, false, false),
            CommandKind::Context => dna!(false, false, false, false, false, false, true),
            CommandKind::Count => dna!(true, false, true, true, true, false, false),
            CommandKind::Delete => dna!(false, true, true, false, true, true, false),
            CommandKind::Denotate => dna!(false, true, false, false, true, false, true),
            CommandKind::Done => dna!(false, true, true, false, true, true, false),
            CommandKind::Duplicate => dna!(false, true, true, false, true, true, false),
            CommandKind::Export => dna!(true, false, true, false, true, false, false),
            CommandKind::Help => dna!(true, false, false, false, false, false, false),
            CommandKind::Ids => dna!(true, true, true, true, true, false, false),
            CommandKind::Import => dna!(false, true, false, false, false, false, true),
            CommandKind::Information => dna!(true, true, true, false, true, false, false),
            CommandKind::List => dna!(true, true, true, true, true, false, false),
            CommandKind::Log => dna!(false, false, false, false, false, true, false),
            CommandKind::Merge => dna!(false, false, true, false, false, false, true),
            CommandKind::Modify => dna!(false, true, true, false, true, true, false),
            CommandKind::Next => dna!(true, true, true, true, true, false, false),
            CommandKind::Prepend => dna!(false, true, false, false, true, false, true),
            CommandKind::Projects => dna!(true, false, true, true, true, false, false),
            CommandKind::Pull => dna!(false, false, false, false, false, false, true),
            CommandKind::Push => dna!(false, false, false, false, false, false, true),
            CommandKind::Show => dna!(true, false, false, false, false, false, true),
            CommandKind::Start => dna!(false, true, true, false, true, true, false),
            CommandKind::Stats => dna!(true, false, true, false, true, false, false),
            CommandKind::Stop => dna!(false, true, true, false, true, true, false),
            CommandKind::Tags => dna!(true, false, true, true, true, false, false),
            CommandKind::Undo => dna!(false, false, false, false, false, false, false),
            CommandKind::Uuids => dna!(true, false, true, true, true, false, false),
            CommandKind::Version => dna!(true, false, false, false, false, false, false),
        }
    }

    /// Resolve a raw token to a command. Exact command names win; an exact
    /// attribute name is never a command; otherwise prefix-unique
    /// completion with the configured minimum length.
    pub fn canonicalize(
        raw: &str,
        cfg: &Config,
        registry: &AttributeRegistry,
    ) -> Option<CommandKind> {
        if raw.is_empty() {
            return None;
        }

        if let Some(exact) = Self::ALL.iter().find(|k| k.name() == raw) {
            return Some(*exact);
        }
        if registry.is_attribute(raw) {
            return None;
        }

        let minimum = cfg.get_int("abbreviation.minimum").unwrap_or(3).max(1) as usize;
        if raw.len() < minimum {
            return None;
        }

        let mut matches = Self::ALL.iter().filter(|k| k.name().starts_with(raw));
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(*first)
    }
}

/// Dispatch one parsed invocation against the store. GC and recurrence run
/// first for commands that declare the need; one commit covers everything
/// the handler changed.
#[instrument(skip(store, cfg, renderer, inv, now))]
pub fn dispatch(
    store: &mut TaskStore,
    cfg: &Config,
    renderer: &mut Renderer,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let dna = inv.command.dna();
    let hooks = HookRunner::new(cfg, store.data_dir());
    hooks.run_on_launch()?;

    let mut warnings = Warnings::default();

    if dna.needs_gc && cfg.get_bool("gc").unwrap_or(true) {
        let moved = store.gc(now)?;
        let created = recur::expand(store, cfg, now)?;
        debug!(moved, created, "gc and recurrence pass complete");
    }

    debug!(command = inv.command.name(), "dispatching");
    match inv.command {
        CommandKind::Add => cmd_add(store, cfg, &hooks, inv, now, &mut warnings)?,
        CommandKind::Annotate => cmd_annotate(store, cfg, inv, now, &mut warnings)?,
        CommandKind::Append => cmd_append_prepend(store, cfg, inv, now, &mut warnings, false)?,
        CommandKind::Calendar => cmd_calendar(store, cfg, inv, now)?,
        CommandKind::Context => cmd_context(store, cfg, inv)?,
        CommandKind::Count => cmd_count(store, cfg, inv, now)?,
        CommandKind::Delete => cmd_done_delete(store, cfg, &hooks, inv, now, &mut warnings, true)?,
        CommandKind::Denotate => cmd_denotate(store, cfg, inv, now, &mut warnings)?,
        CommandKind::Done => cmd_done_delete(store, cfg, &hooks, inv, now, &mut warnings, false)?,
        CommandKind::Duplicate => cmd_duplicate(store, cfg, inv, now, &mut warnings)?,
        CommandKind::Export => cmd_export(store, cfg, inv, now)?,
        CommandKind::Help => cmd_help()?,
        CommandKind::Ids => cmd_ids(store, cfg, inv, now)?,
        CommandKind::Import => cmd_import(store, cfg, &hooks, inv, now, &mut warnings)?,
        CommandKind::Information => cmd_information(store, cfg, renderer, inv, now)?,
        CommandKind::List => cmd_report(store, cfg, renderer, inv, now, SortOrder::ById)?,
        CommandKind::Log => cmd_log(store, cfg, &hooks, inv, now, &mut warnings)?,
        CommandKind::Merge => cmd_merge(store, inv, now)?,
        CommandKind::Modify => cmd_modify(store, cfg, &hooks, inv, now, &mut warnings)?,
        CommandKind::Next => cmd_report(store, cfg, renderer, inv, now, SortOrder::ByUrgency)?,
        CommandKind::Prepend => cmd_append_prepend(store, cfg, inv, now, &mut warnings, true)?,
        CommandKind::Projects => cmd_projects(store, cfg, inv, now)?,
        CommandKind::Pull => cmd_pull(store, inv)?,
        CommandKind::Push => cmd_push(store, inv)?,
        CommandKind::Show => cmd_show(cfg, inv)?,
        CommandKind::Start => cmd_start_stop(store, cfg, inv, now, &mut warnings, true)?,
        CommandKind::Stats => cmd_stats(store, cfg, inv, now)?,
        CommandKind::Stop => cmd_start_stop(store, cfg, inv, now, &mut warnings, false)?,
        CommandKind::Tags => cmd_tags(store, cfg, inv, now)?,
        CommandKind::Undo => cmd_undo(store, cfg, renderer)?,
        CommandKind::Uuids => cmd_uuids(store, cfg, inv, now)?,
        CommandKind::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }

    store.commit(now)?;

    if !warnings.is_empty() {
        renderer.print_footnotes(&warnings.drain())?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Selection.

fn eval_settings(cfg: &Config) -> EvalSettings {
    EvalSettings {
        case_sensitive: cfg.get_bool("search.case.sensitive").unwrap_or(true),
        regex: cfg.get_bool("regex").unwrap_or(true),
    }
}

fn date_settings(cfg: &Config) -> DateSettings {
    let mut settings = DateSettings::default();
    if let Some(fmt) = cfg.get("dateformat") {
        settings.dateformat = fmt;
    }
    if let Some(ws) = cfg.get("weekstart")
        && ws.eq_ignore_ascii_case("monday")
    {
        settings.weekstart = chrono::Weekday::Mon;
    }
    settings
}

fn filter_mentions(postfix: &[Token], name: &str) -> bool {
    postfix
        .iter()
        .any(|t| t.kind == TokenKind::Identifier && t.lexeme == name)
}

/// Evaluate the filter over the store. The default report scope is the
/// pending file minus waiting tasks; naming `status`, an id, a uuid or a
/// non-pending virtual tag widens the scope to everything.
fn select_tasks(
    store: &TaskStore,
    cfg: &Config,
    registry: &AttributeRegistry,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let settings = eval_settings(cfg);
    let widened = filter_mentions(&inv.filter, "status")
        || filter_mentions(&inv.filter, "uuid")
        || filter_mentions(&inv.filter, "id")
        || filter_mentions(&inv.filter, "end")
        || inv.filter.iter().any(|t| {
            matches!(t.lexeme.as_str(), "COMPLETED" | "DELETED" | "WAITING")
        });

    let ctx = DomContext {
        cfg,
        registry,
        now,
        source: Some(&*store),
    };

    let mut out = Vec::new();
    let candidates: Vec<Task> = if widened {
        store.all_tasks().cloned().collect()
    } else {
        store
            .pending_tasks()
            .iter()
            .filter(|t| matches!(t.status(), Status::Pending | Status::Recurring))
            .cloned()
            .collect()
    };

    for task in candidates {
        if expr::matches(&inv.filter, &task, &ctx, &settings)? {
            out.push(task);
        }
    }
    Ok(out)
}

/// Selection for write commands: requires a filter, and reaches waiting
/// and recurring tasks too.
fn select_for_write(
    store: &TaskStore,
    cfg: &Config,
    registry: &AttributeRegistry,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    if inv.filter.is_empty() {
        return Err(Error::Parse(format!(
            "the {} command requires a filter",
            inv.command.name()
        )));
    }

    let settings = eval_settings(cfg);
    let ctx = DomContext {
        cfg,
        registry,
        now,
        source: Some(&*store),
    };

    let mut out = Vec::new();
    for task in store.all_tasks() {
        if expr::matches(&inv.filter, task, &ctx, &settings)? {
            out.push(task.clone());
        }
    }

    if out.is_empty() {
        return Err(Error::NotFound("no tasks matched the filter".to_string()));
    }
    Ok(out)
}

fn compute_urgencies(store: &TaskStore, cfg: &Config, tasks: &[Task], now: DateTime<Utc>) {
    for task in tasks {
        let inputs = UrgencyInputs {
            now,
            is_blocked: store.is_blocked(task),
            is_blocking: store.is_blocking(task),
        };
        urgency::urgency(task, cfg, &inputs);
    }
}

// ----------------------------------------------------------------------
// Modification application.

/// Interpret modification tokens against one task: attribute pairs, tag
/// changes, substitutions, and bare words forming a description.
fn apply_modifications(
    store: &TaskStore,
    cfg: &Config,
    registry: &AttributeRegistry,
    task: &mut Task,
    mods: &[Token],
    now: DateTime<Utc>,
) -> Result<()> {
    let dates_cfg = date_settings(cfg);
    let mut words: Vec<String> = Vec::new();

    for token in mods {
        match token.kind {
            TokenKind::Pair => {
                let (name, modifier, value) = split_pair(&token.lexeme)?;
                if modifier.is_some() {
                    return Err(Error::Parse(format!(
                        "attribute modifiers are not allowed in modifications: {}",
                        token.lexeme
                    )));
                }
                apply_attribute(store, cfg, registry, task, &name, &value, now, &dates_cfg)?;
            }
            TokenKind::Tag => {
                let (sign, name) = token.lexeme.split_at(1);
                if sign == "+" {
                    task.add_tag(name);
                } else {
                    task.remove_tag(name);
                }
            }
            TokenKind::Substitution => {
                apply_substitution(cfg, task, &token.lexeme)?;
            }
            _ => words.push(token.lexeme.clone()),
        }
    }

    if !words.is_empty() {
        task.set("description", words.join(" "));
    }
    Ok(())
}

fn apply_attribute(
    store: &TaskStore,
    cfg: &Config,
    registry: &AttributeRegistry,
    task: &mut Task,
    name: &str,
    value: &str,
    now: DateTime<Utc>,
    dates_cfg: &DateSettings,
) -> Result<()> {
    if value.is_empty() {
        task.remove(name);
        return Ok(());
    }

    if name == "depends" {
        return apply_depends(store, task, value);
    }

    match registry.attr_type(name) {
        Some(AttrType::Date) => {
            let dt = dates::parse_date(value, now, dates_cfg).ok_or_else(|| {
                Error::Validation(format!("'{value}' is not a valid date for '{name}'"))
            })?;
            task.set_date(name, dt);
        }
        Some(AttrType::DurationVal) => {
            let _: Duration = value.parse().map_err(|_| {
                Error::Validation(format!("'{value}' is not a valid duration for '{name}'"))
            })?;
            task.set(name, value);
        }
        Some(AttrType::Numeric) => {
            if value.parse::<f64>().is_err() {
                return Err(Error::Validation(format!(
                    "'{value}' is not a number for '{name}'"
                )));
            }
            task.set(name, value);
        }
        Some(AttrType::Text) => {
            // A configured value list constrains UDA text values.
            if let Some(allowed) = cfg.get(&format!("uda.{name}.values"))
                && !allowed.split(',').any(|v| v == value)
            {
                return Err(Error::Validation(format!(
                    "'{value}' is not one of the allowed values for '{name}'"
                )));
            }
            task.set(name, value);
        }
        None => {
            return Err(Error::Parse(format!("unknown attribute: {name}")));
        }
    }

    // Setting a wait date implies waiting status.
    if name == "wait"
        && task.get_date("wait").map(|w| w > now).unwrap_or(false)
        && task.status() == Status::Pending
    {
        task.set_status(Status::Waiting);
    }
    Ok(())
}

/// A pending task with a recurrence period is a recurring parent; runs
/// after all modifications so pair order does not matter.
fn promote_recurring(task: &mut Task) {
    if task.has("recur") && task.status() == Status::Pending {
        task.set_status(Status::Recurring);
    }
}

/// `depends:1,2` style values: ids, uuids, comma lists, `-` prefix removes.
fn apply_depends(store: &TaskStore, task: &mut Task, value: &str) -> Result<()> {
    for element in value.split(',') {
        if element.is_empty() {
            continue;
        }
        let (removing, reference) = match element.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, element),
        };

        let dep = if let Ok(id) = reference.parse::<u64>() {
            store
                .get_by_id(id)
                .ok_or_else(|| Error::NotFound(reference.to_string()))?
        } else {
            store
                .get_by_uuid(reference)
                .ok_or_else(|| Error::NotFound(reference.to_string()))?
        };

        if removing {
            task.remove_depend(dep.uuid());
        } else {
            task.add_depend(dep.uuid());
        }
    }
    Ok(())
}

fn apply_substitution(cfg: &Config, task: &mut Task, lexeme: &str) -> Result<()> {
    let parts = split_substitution(lexeme)
        .ok_or_else(|| Error::Parse(format!("malformed substitution: {lexeme}")))?;
    let (from, to, global) = parts;

    let description = task.description().to_string();
    let replaced = if cfg.get_bool("regex").unwrap_or(true) {
        let re = regex::Regex::new(&from)
            .map_err(|e| Error::Parse(format!("bad substitution pattern '{from}': {e}")))?;
        if global {
            re.replace_all(&description, to.as_str()).to_string()
        } else {
            re.replace(&description, to.as_str()).to_string()
        }
    } else if global {
        description.replace(&from, &to)
    } else {
        description.replacen(&from, &to, 1)
    };

    task.set("description", replaced);
    Ok(())
}

fn split_substitution(lexeme: &str) -> Option<(String, String, bool)> {
    let rest = lexeme.strip_prefix('/')?;
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '/' => {
                parts.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    if parts.len() != 2 {
        return None;
    }
    let global = current == "g";
    Some((parts.remove(0), parts.remove(0), global))
}

// ----------------------------------------------------------------------
// Write commands.

#[instrument(skip_all)]
fn cmd_add(
    store: &mut TaskStore,
    cfg: &Config,
    hooks: &HookRunner,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
) -> Result<()> {
    let registry = store.registry().clone();

    let mut task = Task::new();
    apply_modifications(store, cfg, &registry, &mut task, &inv.modifications, now)?;
    task.apply_defaults(cfg, &registry, now);
    promote_recurring(&mut task);
    task.validate(warnings)?;
    store.ensure_no_cycle(&task)?;

    let task = hooks.apply_on_add(&task, &registry)?;
    task.validate(warnings)?;

    let added = store.add(task, now)?;
    info!(uuid = added.uuid(), id = added.id, "task created");
    println!("Created task {}.", added.id);
    Ok(())
}

#[instrument(skip_all)]
fn cmd_log(
    store: &mut TaskStore,
    cfg: &Config,
    hooks: &HookRunner,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
) -> Result<()> {
    let registry = store.registry().clone();

    let mut task = Task::new();
    apply_modifications(store, cfg, &registry, &mut task, &inv.modifications, now)?;
    task.apply_defaults(cfg, &registry, now);
    task.set_status(Status::Completed);
    task.set_date("end", now);
    task.validate(warnings)?;

    let task = hooks.apply_on_add(&task, &registry)?;
    store.add(task, now)?;
    println!("Logged task.");
    Ok(())
}

#[instrument(skip_all)]
fn cmd_modify(
    store: &mut TaskStore,
    cfg: &Config,
    hooks: &HookRunner,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
) -> Result<()> {
    let registry = store.registry().clone();
    let selected = select_for_write(store, cfg, &registry, inv, now)?;

    let mut count = 0;
    for old in selected {
        let mut task = old.clone();
        apply_modifications(store, cfg, &registry, &mut task, &inv.modifications, now)?;
        promote_recurring(&mut task);
        if task == old {
            warnings.push(format!("task {} unchanged", display_ref(&old)));
            continue;
        }
        task.validate(warnings)?;
        let task = hooks.apply_on_modify(&old, &task, &registry)?;
        store.modify(task, now)?;
        count += 1;
    }

    println!("Modified {count} task{}.", plural(count));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_done_delete(
    store: &mut TaskStore,
    cfg: &Config,
    hooks: &HookRunner,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
    deleting: bool,
) -> Result<()> {
    let registry = store.registry().clone();
    let selected = select_for_write(store, cfg, &registry, inv, now)?;
    let (target, mask_char, label) = if deleting {
        (Status::Deleted, recur::MASK_DELETED, "Deleted")
    } else {
        (Status::Completed, recur::MASK_COMPLETED, "Completed")
    };

    let mut count = 0;
    for old in selected {
        if old.status() == target {
            warnings.push(format!(
                "task {} is already {}",
                display_ref(&old),
                target.as_str()
            ));
            continue;
        }

        let mut task = old.clone();
        if !inv.modifications.is_empty() {
            apply_modifications(store, cfg, &registry, &mut task, &inv.modifications, now)?;
        }
        task.set_status(target);
        task.set_date("end", now);
        task.remove("start");
        task.validate(warnings)?;

        let task = hooks.apply_on_modify(&old, &task, &registry)?;
        store.modify(task.clone(), now)?;
        recur::update_parent_mask(store, &task, mask_char, now)?;
        count += 1;
    }

    if cfg.get_bool("gc").unwrap_or(true) {
        store.gc(now)?;
    }
    println!("{label} {count} task{}.", plural(count));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_start_stop(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
    starting: bool,
) -> Result<()> {
    let registry = store.registry().clone();
    let selected = select_for_write(store, cfg, &registry, inv, now)?;

    let mut count = 0;
    for old in selected {
        let mut task = old.clone();
        if starting {
            if task.has("start") {
                warnings.push(format!("task {} is already started", display_ref(&old)));
                continue;
            }
            task.set_date("start", now);
        } else {
            if !task.has("start") {
                warnings.push(format!("task {} is not started", display_ref(&old)));
                continue;
            }
            task.remove("start");
        }
        if !inv.modifications.is_empty() {
            apply_modifications(store, cfg, &registry, &mut task, &inv.modifications, now)?;
        }
        store.modify(task, now)?;
        count += 1;
    }

    let verb = if starting { "Started" } else { "Stopped" };
    println!("{verb} {count} task{}.", plural(count));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_annotate(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
) -> Result<()> {
    if inv.miscellaneous.is_empty() {
        return Err(Error::Parse("annotate requires annotation text".to_string()));
    }
    let text = inv.miscellaneous.join(" ");

    let registry = store.registry().clone();
    let selected = select_for_write(store, cfg, &registry, inv, now)?;
    let mut count = 0;
    for old in selected {
        let mut task = old.clone();
        task.add_annotation(now, &text);
        task.validate(warnings)?;
        store.modify(task, now)?;
        count += 1;
    }

    println!("Annotated {count} task{}.", plural(count));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_denotate(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
) -> Result<()> {
    let needle = inv.miscellaneous.join(" ");
    let registry = store.registry().clone();
    let selected = select_for_write(store, cfg, &registry, inv, now)?;

    let mut count = 0;
    for old in selected {
        let mut task = old.clone();
        let removed = if needle.is_empty() {
            // No pattern: drop the newest annotation.
            match task.annotations().last() {
                Some((epoch, _)) => {
                    task.remove(&format!("annotation_{epoch}"));
                    1
                }
                None => 0,
            }
        } else {
            task.remove_annotations_matching(&needle)
        };

        if removed == 0 {
            warnings.push(format!(
                "task {} has no matching annotations",
                display_ref(&old)
            ));
            continue;
        }
        store.modify(task, now)?;
        count += 1;
    }

    println!("Denotated {count} task{}.", plural(count));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_append_prepend(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
    prepending: bool,
) -> Result<()> {
    if inv.miscellaneous.is_empty() {
        return Err(Error::Parse(format!(
            "{} requires text to add",
            inv.command.name()
        )));
    }
    let text = inv.miscellaneous.join(" ");

    let registry = store.registry().clone();
    let selected = select_for_write(store, cfg, &registry, inv, now)?;
    let mut count = 0;
    for old in selected {
        let mut task = old.clone();
        let description = if prepending {
            format!("{text} {}", task.description())
        } else {
            format!("{} {text}", task.description())
        };
        task.set("description", description.trim());
        task.validate(warnings)?;
        store.modify(task, now)?;
        count += 1;
    }

    let verb = if prepending { "Prepended to" } else { "Appended to" };
    println!("{verb} {count} task{}.", plural(count));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_duplicate(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
) -> Result<()> {
    let registry = store.registry().clone();
    let selected = select_for_write(store, cfg, &registry, inv, now)?;

    let mut count = 0;
    for original in selected {
        let mut copy = original.clone();
        copy.set("uuid", uuid::Uuid::new_v4().to_string());
        copy.set_status(Status::Pending);
        copy.set_date("entry", now);
        copy.remove("start");
        copy.remove("end");
        copy.remove("modified");
        copy.remove("parent");
        copy.remove("imask");
        copy.remove("mask");
        if !inv.modifications.is_empty() {
            apply_modifications(store, cfg, &registry, &mut copy, &inv.modifications, now)?;
        }
        copy.validate(warnings)?;
        let added = store.add(copy, now)?;
        println!("Duplicated as task {}.", added.id);
        count += 1;
    }

    debug!(count, "duplication complete");
    Ok(())
}

#[instrument(skip_all)]
fn cmd_undo(store: &mut TaskStore, cfg: &Config, renderer: &mut Renderer) -> Result<()> {
    let Some(last) = store.last_transaction()? else {
        return Err(Error::Validation("no undoable transactions".to_string()));
    };

    renderer.print_transaction_diff(last.old.as_ref(), &last.new, last.time)?;

    if cfg.get_bool("confirmation").unwrap_or(true) && io::stdin().is_terminal() {
        print!("Undo this change? (yes/no) ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        let answer = answer.trim().to_ascii_lowercase();
        if answer != "y" && answer != "yes" {
            println!("No changes made.");
            return Ok(());
        }
    }

    let reverted = store.revert()?;
    println!("Reverted the last change to task {}.", reverted.uuid());
    Ok(())
}

#[instrument(skip_all)]
fn cmd_import(
    store: &mut TaskStore,
    cfg: &Config,
    hooks: &HookRunner,
    inv: &Invocation,
    now: DateTime<Utc>,
    warnings: &mut Warnings,
) -> Result<()> {
    let registry = store.registry().clone();

    let mut payload = String::new();
    if inv.miscellaneous.is_empty() {
        io::stdin().lock().read_to_string(&mut payload)?;
    } else {
        for file in &inv.miscellaneous {
            payload.push_str(&fs::read_to_string(file)?);
            payload.push('\n');
        }
    }

    let mut values: Vec<serde_json::Value> = Vec::new();
    let trimmed = payload.trim();
    if trimmed.starts_with('[') {
        let array: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| Error::Parse(format!("invalid import JSON: {e}")))?;
        match array {
            serde_json::Value::Array(items) => values.extend(items),
            other => values.push(other),
        }
    } else {
        for line in trimmed.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            values.push(
                serde_json::from_str(line)
                    .map_err(|e| Error::Parse(format!("invalid import JSON: {e}")))?,
            );
        }
    }

    let mut added = 0;
    let mut updated = 0;
    for value in values {
        let mut task = Task::parse_json(&value, &registry)?;
        task.apply_defaults(cfg, &registry, now);
        task.validate(warnings)?;

        match store.get_by_uuid(task.uuid()) {
            Some(existing) => {
                if existing == task {
                    continue;
                }
                let task = hooks.apply_on_modify(&existing, &task, &registry)?;
                store.modify(task, now)?;
                updated += 1;
            }
            None => {
                let task = hooks.apply_on_add(&task, &registry)?;
                store.add(task, now)?;
                added += 1;
            }
        }
    }

    if cfg.get_bool("gc").unwrap_or(true) {
        store.gc(now)?;
    }
    println!("Imported {added} new, {updated} updated.");
    Ok(())
}

// ----------------------------------------------------------------------
// Sync commands.

fn resolve_remote_path(reference: &str) -> PathBuf {
    let stripped = reference.strip_prefix("file://").unwrap_or(reference);
    let path = PathBuf::from(stripped);
    if path.is_dir() {
        path.join(store::UNDO_DATA)
    } else {
        path
    }
}

#[instrument(skip_all)]
fn cmd_merge(store: &mut TaskStore, inv: &Invocation, _now: DateTime<Utc>) -> Result<()> {
    let Some(reference) = inv.miscellaneous.first() else {
        return Err(Error::Parse("merge requires a remote undo file or data directory".to_string()));
    };

    let remote = resolve_remote_path(reference);
    if !remote.exists() {
        return Err(Error::Sync(format!("cannot read {}", remote.display())));
    }
    let remote_lines = store::read_lines(&remote)?;

    let outcome = merge::merge(store, &remote_lines)?;
    for message in &outcome.messages {
        println!("{message}");
    }

    if outcome.up_to_date() {
        println!("Database is up to date, no merge required.");
    } else if outcome.remote_changes {
        println!("Merge complete.");
    } else {
        println!("Local database is ahead; nothing to merge.");
    }
    Ok(())
}

/// File-based transport: a directory holding the four data files. Network
/// transports plug in at this seam.
#[instrument(skip_all)]
fn cmd_push(store: &mut TaskStore, inv: &Invocation) -> Result<()> {
    let Some(reference) = inv.miscellaneous.first() else {
        return Err(Error::Parse("push requires a destination".to_string()));
    };
    let target = PathBuf::from(
        reference
            .strip_prefix("file://")
            .unwrap_or(reference),
    );
    fs::create_dir_all(&target)?;

    for name in [
        store::PENDING_DATA,
        store::COMPLETED_DATA,
        store::UNDO_DATA,
        store::BACKLOG_DATA,
    ] {
        let source = store.data_dir().join(name);
        if source.exists() {
            fs::copy(&source, target.join(name))?;
        }
    }
    println!("Pushed to {}.", target.display());
    Ok(())
}

#[instrument(skip_all)]
fn cmd_pull(store: &mut TaskStore, inv: &Invocation) -> Result<()> {
    let Some(reference) = inv.miscellaneous.first() else {
        return Err(Error::Parse("pull requires a source".to_string()));
    };
    let source = PathBuf::from(
        reference
            .strip_prefix("file://")
            .unwrap_or(reference),
    );
    if !source.is_dir() {
        return Err(Error::Sync(format!("{} is not a data directory", source.display())));
    }

    for name in [
        store::PENDING_DATA,
        store::COMPLETED_DATA,
        store::UNDO_DATA,
        store::BACKLOG_DATA,
    ] {
        let remote = source.join(name);
        if remote.exists() {
            fs::copy(&remote, store.data_dir().join(name))?;
        }
    }
    println!("Pulled from {}.", source.display());
    Ok(())
}

// ----------------------------------------------------------------------
// Read commands.

enum SortOrder {
    ById,
    ByUrgency,
}

#[instrument(skip_all)]
fn cmd_report(
    store: &mut TaskStore,
    cfg: &Config,
    renderer: &mut Renderer,
    inv: &Invocation,
    now: DateTime<Utc>,
    order: SortOrder,
) -> Result<()> {
    let registry = store.registry().clone();
    let mut tasks = select_tasks(store, cfg, &registry, inv, now)?;
    compute_urgencies(store, cfg, &tasks, now);

    match order {
        SortOrder::ById => tasks.sort_by_key(|t| t.id),
        SortOrder::ByUrgency => tasks.sort_by(|a, b| {
            let ua = a.urgency_cached().unwrap_or(0.0);
            let ub = b.urgency_cached().unwrap_or(0.0);
            ub.partial_cmp(&ua).unwrap_or(std::cmp::Ordering::Equal)
        }),
    }

    if let Some(limit) = inv.limit {
        let rows = match limit {
            Limit::Rows(n) => n,
            Limit::Page => 25,
        };
        tasks.truncate(rows);
    }

    if tasks.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    renderer.print_task_table(&tasks, now)?;
    Ok(())
}

#[instrument(skip_all)]
fn cmd_information(
    store: &mut TaskStore,
    cfg: &Config,
    renderer: &mut Renderer,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();

    // Information reaches everything the filter names, in any file.
    let settings = eval_settings(cfg);
    let ctx = DomContext {
        cfg,
        registry: &registry,
        now,
        source: Some(&*store),
    };
    let mut tasks: Vec<Task> = Vec::new();
    for task in store.all_tasks() {
        if expr::matches(&inv.filter, task, &ctx, &settings)? {
            tasks.push(task.clone());
        }
    }

    if tasks.is_empty() {
        return Err(Error::NotFound("no tasks matched the filter".to_string()));
    }

    compute_urgencies(store, cfg, &tasks, now);
    let count = tasks.len();
    for (idx, task) in tasks.iter().enumerate() {
        renderer.print_task_detail(task)?;
        if idx + 1 < count {
            println!();
        }
    }
    Ok(())
}

#[instrument(skip_all)]
fn cmd_count(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();
    let tasks = select_tasks(store, cfg, &registry, inv, now)?;
    println!("{}", tasks.len());
    Ok(())
}

#[instrument(skip_all)]
fn cmd_ids(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();
    let mut tasks = select_tasks(store, cfg, &registry, inv, now)?;
    tasks.sort_by_key(|t| t.id);
    let ids: Vec<String> = tasks
        .iter()
        .filter(|t| t.id > 0)
        .map(|t| t.id.to_string())
        .collect();
    println!("{}", ids.join(" "));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_uuids(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();
    let tasks = select_tasks(store, cfg, &registry, inv, now)?;
    for task in &tasks {
        println!("{}", task.uuid());
    }
    Ok(())
}

#[instrument(skip_all)]
fn cmd_export(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();

    let settings = eval_settings(cfg);
    let ctx = DomContext {
        cfg,
        registry: &registry,
        now,
        source: Some(&*store),
    };

    let mut out = io::stdout().lock();
    for task in store.all_tasks() {
        if expr::matches(&inv.filter, task, &ctx, &settings)? {
            writeln!(out, "{}", task.compose_json(&registry, true))?;
        }
    }
    Ok(())
}

#[instrument(skip_all)]
fn cmd_projects(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();
    let tasks = select_tasks(store, cfg, &registry, inv, now)?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for task in &tasks {
        let project = task.get("project").unwrap_or("(none)").to_string();
        *counts.entry(project).or_default() += 1;
    }

    for (project, count) in &counts {
        println!("{project:<24} {count}");
    }
    println!();
    println!("{} project{}", counts.len(), plural(counts.len()));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_tags(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();
    let tasks = select_tasks(store, cfg, &registry, inv, now)?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for task in &tasks {
        for tag in task.tags() {
            *counts.entry(tag).or_default() += 1;
        }
    }

    for (tag, count) in &counts {
        println!("{tag:<24} {count}");
    }
    println!();
    println!("{} tag{}", counts.len(), plural(counts.len()));
    Ok(())
}

#[instrument(skip_all)]
fn cmd_stats(
    store: &mut TaskStore,
    _cfg: &Config,
    _inv: &Invocation,
    _now: DateTime<Utc>,
) -> Result<()> {
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut annotations = 0;
    let mut tags: std::collections::BTreeSet<String> = Default::default();
    let mut projects: std::collections::BTreeSet<String> = Default::default();

    for task in store.all_tasks() {
        *by_status.entry(task.status().as_str()).or_default() += 1;
        annotations += task.annotation_count();
        tags.extend(task.tags());
        if let Some(project) = task.get("project") {
            projects.insert(project.to_string());
        }
    }

    let total: usize = by_status.values().sum();
    for (status, count) in &by_status {
        println!("{status:<12} {count}");
    }
    println!("total        {total}");
    println!("annotations  {annotations}");
    println!("unique tags  {}", tags.len());
    println!("projects     {}", projects.len());
    Ok(())
}

#[instrument(skip_all)]
fn cmd_context(store: &mut TaskStore, cfg: &Config, inv: &Invocation) -> Result<()> {
    let context_path = store.data_dir().join("context.data");
    let current = fs::read_to_string(&context_path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    match inv.miscellaneous.first().map(String::as_str) {
        None | Some("show") => {
            if current.is_empty() {
                println!("No context is active.");
            } else {
                println!(
                    "Context '{current}' is active: {}",
                    cfg.get(&format!("context.{current}")).unwrap_or_default()
                );
            }
        }
        Some("none") => {
            fs::write(&context_path, "")?;
            println!("Context cleared.");
        }
        Some(name) => {
            if cfg.get(&format!("context.{name}")).is_none() {
                return Err(Error::Validation(format!(
                    "context '{name}' is not defined; set context.{name} in the rc file"
                )));
            }
            fs::write(&context_path, name)?;
            println!("Context '{name}' set.");
        }
    }
    Ok(())
}

#[instrument(skip_all)]
fn cmd_show(cfg: &Config, inv: &Invocation) -> Result<()> {
    let prefix = inv.miscellaneous.first().map(String::as_str).unwrap_or("");
    let mut entries: Vec<(String, String)> = cfg
        .iter()
        .filter(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    entries.sort();

    for (key, value) in entries {
        println!("{key}={value}");
    }
    Ok(())
}

/// A month grid with due-date markers; the layout-only surface of the
/// calendar report.
#[instrument(skip_all)]
fn cmd_calendar(
    store: &mut TaskStore,
    cfg: &Config,
    inv: &Invocation,
    now: DateTime<Utc>,
) -> Result<()> {
    let registry = store.registry().clone();
    let tasks = select_tasks(store, cfg, &registry, inv, now)?;

    let local = now.with_timezone(&chrono::Local);
    let year = local.year();
    let month = local.month();
    let due_days: std::collections::BTreeSet<u32> = tasks
        .iter()
        .filter_map(|t| t.get_date("due"))
        .map(|d| d.with_timezone(&chrono::Local))
        .filter(|d| d.year() == year && d.month() == month)
        .map(|d| d.day())
        .collect();

    let monday_start = cfg
        .get("weekstart")
        .map(|w| w.eq_ignore_ascii_case("monday"))
        .unwrap_or(false);

    println!("{:^28}", format!("{} {year}", month_name(month)));
    if monday_start {
        println!("Mo Tu We Th Fr Sa Su");
    } else {
        println!("Su Mo Tu We Th Fr Sa");
    }

    let first = chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| Error::Validation("calendar date out of range".to_string()))?;
    let offset = if monday_start {
        first.weekday().num_days_from_monday()
    } else {
        first.weekday().num_days_from_sunday()
    } as usize;

    let days_in_month = {
        let next = if month == 12 {
            chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)
        };
        next.and_then(|n| n.pred_opt())
            .map(|d| d.day())
            .unwrap_or(31)
    };

    let mut line = "   ".repeat(offset);
    let mut column = offset;
    for day in 1..=days_in_month {
        let marker = if due_days.contains(&day) { '!' } else { ' ' };
        line.push_str(&format!("{day:>2}{marker}"));
        column += 1;
        if column == 7 {
            println!("{}", line.trim_end());
            line.clear();
            column = 0;
        }
    }
    if !line.trim().is_empty() {
        println!("{}", line.trim_end());
    }
    Ok(())
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        _ => "December",
    }
}

fn cmd_help() -> Result<()> {
    println!("Usage: task [<filter>] <command> [<modifications>]");
    println!();
    println!("Commands:");
    for kind in CommandKind::ALL {
        println!("  {}", kind.name());
    }
    println!();
    println!("See the rc file for configuration; rc.<name>=<value> overrides.");
    Ok(())
}

fn display_ref(task: &Task) -> String {
    if task.id > 0 {
        task.id.to_string()
    } else {
        task.uuid().chars().take(8).collect()
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

#[cfg(test)]
mod tests {
    use super::CommandKind;
    use crate::config::Config;
    use crate::task::AttributeRegistry;

    fn registry() -> AttributeRegistry {
        AttributeRegistry::from_config(&Config::defaults())
    }

    #[test]
    fn exact_names_always_resolve() {
        let cfg = Config::defaults();
        for kind in CommandKind::ALL {
            assert_eq!(
                CommandKind::canonicalize(kind.name(), &cfg, &registry()),
                Some(*kind),
                "command {} must resolve to itself",
                kind.name()
            );
        }
    }

    #[test]
    fn unique_prefixes_complete() {
        let cfg = Config::defaults();
        assert_eq!(
            CommandKind::canonicalize("lis", &cfg, &registry()),
            Some(CommandKind::List)
        );
        assert_eq!(
            CommandKind::canonicalize("inf", &cfg, &registry()),
            Some(CommandKind::Information)
        );
        assert_eq!(
            CommandKind::canonicalize("dup", &cfg, &registry()),
            Some(CommandKind::Duplicate)
        );
    }

    #[test]
    fn ambiguous_prefixes_do_not_resolve() {
        let cfg = Config::defaults();
        // start / stats / stop.
        assert_eq!(CommandKind::canonicalize("sta", &cfg, &registry()), None);
        assert_eq!(
            CommandKind::canonicalize("star", &cfg, &registry()),
            Some(CommandKind::Start)
        );
        assert_eq!(
            CommandKind::canonicalize("stat", &cfg, &registry()),
            Some(CommandKind::Stats)
        );
    }

    #[test]
    fn attribute_names_block_completion() {
        let cfg = Config::defaults();
        // `project` is an attribute, so it cannot complete to `projects`.
        assert_eq!(CommandKind::canonicalize("project", &cfg, &registry()), None);
        // But a prefix that is not an attribute still completes.
        assert_eq!(
            CommandKind::canonicalize("projec", &cfg, &registry()),
            Some(CommandKind::Projects)
        );
    }

    #[test]
    fn below_minimum_prefixes_do_not_resolve() {
        let mut cfg = Config::defaults();
        assert_eq!(CommandKind::canonicalize("li", &cfg, &registry()), None);
        cfg.set("abbreviation.minimum", "2");
        assert_eq!(
            CommandKind::canonicalize("li", &cfg, &registry()),
            Some(CommandKind::List)
        );
    }

    #[test]
    fn dna_matrix_consistency() {
        // Exactly the matrix rows of the parser: a command that accepts
        // nothing rejects arguments, read-only commands never need mods.
        for kind in CommandKind::ALL {
            let dna = kind.dna();
            if dna.read_only {
                assert!(
                    !dna.accepts_modifications,
                    "{} is read-only yet accepts modifications",
                    kind.name()
                );
            }
        }
    }
}
