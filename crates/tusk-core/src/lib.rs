pub mod cli;
pub mod commands;
pub mod config;
pub mod dates;
pub mod dom;
pub mod duration;
pub mod error;
pub mod expr;
pub mod hooks;
pub mod lexer;
pub mod merge;
pub mod recur;
pub mod render;
pub mod store;
pub mod task;
pub mod urgency;

use std::ffi::OsString;
use std::fs;

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use tracing::{debug, info};

use crate::error::Error;

/// Run one invocation and return the process exit code: 0 on success, 1 on
/// a user error, 2 on an internal error.
pub fn run(raw_args: Vec<OsString>) -> i32 {
    match run_inner(raw_args) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err:#}");
            err.downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(2)
        }
    }
}

#[tracing::instrument(skip_all)]
fn run_inner(raw_args: Vec<OsString>) -> anyhow::Result<()> {
    let binary = raw_args
        .first()
        .map(|b| b.to_string_lossy().to_string())
        .unwrap_or_else(|| "task".to_string());

    let pre = cli::preprocess_args(&raw_args)?;
    let global = cli::GlobalCli::parse_from(pre.cleaned_args);

    cli::init_tracing(global.verbose, global.quiet)?;

    info!(
        verbose = global.verbose,
        quiet = global.quiet,
        "starting task CLI"
    );
    debug!(?pre.rc_overrides, "preprocessed rc overrides");

    let taskrc = global
        .taskrc
        .clone()
        .or_else(|| pre.taskrc_file.clone());
    let mut cfg = config::Config::load(taskrc.as_deref())?;
    cfg.apply_overrides(
        pre.rc_overrides.into_iter().chain(
            global
                .rc_overrides
                .into_iter()
                .map(|kv| (kv.key, kv.value)),
        ),
    );

    let data_dir = config::resolve_data_dir(&cfg, global.data.as_deref())
        .context("failed to resolve data directory")?;

    // The persisted context selection applies unless an override named one.
    if cfg.get("context").is_none()
        && let Ok(saved) = fs::read_to_string(data_dir.join("context.data"))
    {
        let saved = saved.trim();
        if !saved.is_empty() {
            debug!(context = saved, "restoring saved context");
            cfg.set("context", saved);
        }
    }

    let registry = task::AttributeRegistry::from_config(&cfg);
    let locking = cfg.get_bool("locking").unwrap_or(true);
    let mut store = store::TaskStore::open(&data_dir, registry.clone(), locking)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("failed to open task store at {}", data_dir.display()))?;

    let mut renderer = render::Renderer::new(&cfg)?;
    let now = Utc::now();

    let inv = cli::Invocation::parse(&cfg, &registry, &binary, global.rest, now)?;
    for note in &inv.diagnostics {
        eprintln!("{note}");
    }

    commands::dispatch(&mut store, &cfg, &mut renderer, &inv, now)?;

    info!("done");
    Ok(())
}
