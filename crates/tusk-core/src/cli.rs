use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::CommandKind;
use crate::config::Config;
use crate::dates::DateSettings;
use crate::error::{Error, Result};
use crate::lexer::{self, Lexer, Token, TokenKind, operator_info};
use crate::task::AttributeRegistry;

/// Alias expansion stops after this many passes.
const ALIAS_PASS_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
    pub taskrc_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "task",
    version,
    about = "tusk: a command-line task manager",
    disable_help_subcommand = true,
    arg_required_else_help = false
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "taskrc")]
    pub taskrc: Option<PathBuf>,

    #[arg(long = "data")]
    pub data: Option<PathBuf>,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<OsString>,
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Capture `rc:<file>` and `rc.<name>[:=]<value>` overrides before clap sees
/// the argument vector; everything after a bare `--` passes through intact.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();
    let mut taskrc_file: Option<PathBuf> = None;
    let mut terminated = false;

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();

        if terminated {
            cleaned.push(arg);
            continue;
        }
        if s == "--" {
            terminated = true;
            cleaned.push(arg);
            continue;
        }

        if let Some(file) = s.strip_prefix("rc:") {
            debug!(file = %file, "captured rc file override");
            taskrc_file = Some(PathBuf::from(file));
            continue;
        }

        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = if let Some((k, v)) = rest.split_once('=') {
                Some((format!("rc.{k}"), v.to_string()))
            } else if let Some((k, v)) = rest.split_once(':') {
                Some((format!("rc.{k}"), v.to_string()))
            } else {
                None
            };

            if let Some((k, v)) = parsed {
                debug!(key = %k, value = %v, "captured positional rc override");
                overrides.push((k, v));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
        taskrc_file,
    })
}

/// Row limit from the `limit:` pseudo-attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Rows(usize),
    Page,
}

/// A categorized argument flowing through the pipeline.
#[derive(Debug, Clone)]
struct Arg {
    token: Token,
    original: bool,
    terminated: bool,
}

/// The parsed invocation: a postfix filter program, raw modification
/// tokens, miscellaneous words, and the chosen command.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: CommandKind,
    pub filter: Vec<Token>,
    pub modifications: Vec<Token>,
    pub miscellaneous: Vec<String>,
    pub limit: Option<Limit>,
    pub diagnostics: Vec<String>,
}

impl Invocation {
    /// The full pipeline: lex argv, expand aliases, find the command,
    /// categorize, desugar the filter, convert to postfix.
    #[tracing::instrument(skip(cfg, registry, rest, now))]
    pub fn parse(
        cfg: &Config,
        registry: &AttributeRegistry,
        binary: &str,
        rest: Vec<OsString>,
        now: DateTime<Utc>,
    ) -> Result<Invocation> {
        let dates = date_settings(cfg);
        let mut diagnostics = Vec::new();

        // Lex every argument. An argument that lexes to a single token
        // carries that token's type; anything else stays a word until the
        // desugar pass splits it.
        let mut args: Vec<Arg> = Vec::new();
        let mut terminated = false;
        for os in rest {
            let raw = os.to_string_lossy().to_string();
            if raw == "--" && !terminated {
                terminated = true;
                continue;
            }
            args.push(lex_arg(&raw, terminated, true, now, &dates));
        }

        let args = expand_aliases(args, cfg, now, &dates, &mut diagnostics);

        // Synthetic calendar command when invoked through a cal symlink.
        let binary_base = std::path::Path::new(binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let calendar_binary = binary_base == "cal" || binary_base == "calendar";

        let (args, command) = find_command(args, cfg, registry, calendar_binary, now, &dates)?;
        let dna = command.dna();
        debug!(command = command.name(), "command identified");

        // Demote dashed tags for add/log so description text survives, and
        // canonicalize pair names.
        let mut limit: Option<Limit> = None;
        let mut user_limit = false;
        let args = prepare_args(
            args,
            command,
            cfg,
            registry,
            &mut limit,
            &mut user_limit,
            &mut diagnostics,
        )?;

        // Categorize by DNA and position.
        let mut filter_args: Vec<Arg> = Vec::new();
        let mut modifications: Vec<Token> = Vec::new();
        let mut miscellaneous: Vec<String> = Vec::new();
        let mut seen_command = false;

        for arg in args {
            if !seen_command && is_command_marker(&arg) {
                seen_command = true;
                continue;
            }
            if arg.token.kind == TokenKind::Separator {
                continue;
            }

            match (
                dna.accepts_filter,
                dna.accepts_modifications,
                dna.accepts_miscellaneous,
            ) {
                (false, false, false) => {
                    return Err(Error::Parse(format!(
                        "the {} command takes no arguments: '{}'",
                        command.name(),
                        arg.token.lexeme
                    )));
                }
                (false, false, true) => miscellaneous.push(arg.token.lexeme),
                (false, true, _) => modifications.push(arg.token),
                (true, false, false) => filter_args.push(arg),
                (true, false, true) => {
                    if seen_command {
                        miscellaneous.push(arg.token.lexeme);
                    } else {
                        filter_args.push(arg);
                    }
                }
                (true, true, _) => {
                    if seen_command {
                        modifications.push(arg.token);
                    } else {
                        filter_args.push(arg);
                    }
                }
            }
        }

        // Wrap the user-typed filter in parentheses so report and context
        // filters AND around it safely.
        let mut filter_tokens = parenthesize_originals(filter_args);

        // Context filter, unless the filter already names identities.
        if dna.uses_context
            && !has_identity(&filter_tokens)
            && let Some(context_name) = cfg.get("context")
            && !context_name.is_empty()
            && let Some(context_expr) = cfg.get(&format!("context.{context_name}"))
            && !context_expr.is_empty()
        {
            debug!(context = %context_name, "applying context filter");
            for token in Lexer::lex(&context_expr, now, &dates) {
                if let Some(value) = limit_from_token(&token) {
                    // A user-supplied limit outranks the context's.
                    if !user_limit {
                        limit = Some(value);
                    }
                    continue;
                }
                filter_tokens.push(token);
            }
        }

        let filter_tokens = desugar_filter(filter_tokens, cfg, registry, now, &dates)?;
        let filter_tokens = insert_junctions(filter_tokens);
        let filter = shunting_yard(filter_tokens)?;

        Ok(Invocation {
            command,
            filter,
            modifications,
            miscellaneous,
            limit,
            diagnostics,
        })
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

fn lex_arg(raw: &str, terminated: bool, original: bool, now: DateTime<Utc>, dates: &DateSettings) -> Arg {
    if terminated {
        return Arg {
            token: Token::word(raw),
            original,
            terminated: true,
        };
    }

    let mut tokens = Lexer::lex(raw, now, dates);
    let token = if tokens.len() == 1 {
        tokens.remove(0)
    } else {
        Token::word(raw)
    };
    Arg {
        token,
        original,
        terminated: false,
    }
}

/// Replace alias names with the lexed tokens of their values, to a fixed
/// point, capped at ten passes.
fn expand_aliases(
    mut args: Vec<Arg>,
    cfg: &Config,
    now: DateTime<Utc>,
    dates: &DateSettings,
    diagnostics: &mut Vec<String>,
) -> Vec<Arg> {
    for pass in 0.. {
        if pass >= ALIAS_PASS_LIMIT {
            diagnostics.push("alias substitution stopped after 10 passes".to_string());
            warn!("alias expansion pass limit reached");
            break;
        }

        let mut changed = false;
        let mut next: Vec<Arg> = Vec::with_capacity(args.len());
        for arg in args {
            if arg.terminated {
                next.push(arg);
                continue;
            }
            let alias_key = format!("alias.{}", arg.token.lexeme);
            if let Some(value) = cfg.get(&alias_key) {
                debug!(alias = %arg.token.lexeme, value = %value, "expanding alias");
                for token in Lexer::lex(&value, now, dates) {
                    next.push(Arg {
                        token,
                        original: false,
                        terminated: false,
                    });
                }
                changed = true;
            } else {
                next.push(arg);
            }
        }
        args = next;
        if !changed {
            break;
        }
    }
    args
}

/// A zero-width marker standing where the command name was found.
fn command_marker() -> Token {
    Token::new("", TokenKind::Separator)
}

fn is_command_marker(arg: &Arg) -> bool {
    arg.token.kind == TokenKind::Separator && arg.token.lexeme.is_empty()
}

/// Scan for the command; inject `information` for bare sequences or the
/// configured default command when none is present.
fn find_command(
    mut args: Vec<Arg>,
    cfg: &Config,
    registry: &AttributeRegistry,
    calendar_binary: bool,
    now: DateTime<Utc>,
    dates: &DateSettings,
) -> Result<(Vec<Arg>, CommandKind)> {
    if calendar_binary {
        args.insert(
            0,
            Arg {
                token: command_marker(),
                original: false,
                terminated: false,
            },
        );
        return Ok((args, CommandKind::Calendar));
    }

    let mut found: Option<(usize, CommandKind)> = None;
    for (idx, arg) in args.iter().enumerate() {
        if arg.terminated
            || !matches!(arg.token.kind, TokenKind::Word | TokenKind::Identifier)
        {
            continue;
        }
        if let Some(kind) = CommandKind::canonicalize(&arg.token.lexeme, cfg, registry) {
            found = Some((idx, kind));
            break;
        }
    }

    if let Some((idx, kind)) = found {
        args[idx] = Arg {
            token: command_marker(),
            original: false,
            terminated: false,
        };
        return Ok((args, kind));
    }

    // No command. A sequence of ids/uuids means the user wants details.
    let has_sequence = args.iter().any(|a| {
        !a.terminated
            && matches!(
                a.token.kind,
                TokenKind::Number | TokenKind::Set | TokenKind::Uuid
            )
    });
    if has_sequence {
        debug!("no command but a sequence; defaulting to information");
        args.insert(
            0,
            Arg {
                token: command_marker(),
                original: false,
                terminated: false,
            },
        );
        return Ok((args, CommandKind::Information));
    }

    if let Some(default_command) = cfg.get("default.command")
        && !default_command.trim().is_empty()
    {
        debug!(command = %default_command, "injecting default command");
        let mut injected: Vec<Arg> = Lexer::lex(&default_command, now, dates)
            .into_iter()
            .map(|token| Arg {
                token,
                original: false,
                terminated: false,
            })
            .collect();
        injected.extend(args);
        return find_command_no_default(injected, cfg, registry);
    }

    Err(Error::Parse("you must specify a command or a task to modify".to_string()))
}

fn find_command_no_default(
    mut args: Vec<Arg>,
    cfg: &Config,
    registry: &AttributeRegistry,
) -> Result<(Vec<Arg>, CommandKind)> {
    for idx in 0..args.len() {
        if args[idx].terminated
            || !matches!(args[idx].token.kind, TokenKind::Word | TokenKind::Identifier)
        {
            continue;
        }
        if let Some(kind) = CommandKind::canonicalize(&args[idx].token.lexeme, cfg, registry) {
            args[idx] = Arg {
                token: command_marker(),
                original: false,
                terminated: false,
            };
            return Ok((args, kind));
        }
    }
    Err(Error::Parse("you must specify a command or a task to modify".to_string()))
}

/// Demotion and canonicalization: dashed tags become words for add/log,
/// `limit:` pairs are consumed, pair names complete against the attribute
/// registry, unknown pairs demote to words.
fn prepare_args(
    args: Vec<Arg>,
    command: CommandKind,
    cfg: &Config,
    registry: &AttributeRegistry,
    limit: &mut Option<Limit>,
    user_limit: &mut bool,
    _diagnostics: &mut Vec<String>,
) -> Result<Vec<Arg>> {
    let demote_dash_tags = matches!(command, CommandKind::Add | CommandKind::Log);
    let minimum = cfg.get_int("abbreviation.minimum").unwrap_or(3).max(1) as usize;

    let mut out = Vec::with_capacity(args.len());
    for mut arg in args {
        if arg.terminated {
            out.push(arg);
            continue;
        }

        if demote_dash_tags
            && arg.token.kind == TokenKind::Tag
            && arg.token.lexeme.starts_with('-')
        {
            let lexeme = std::mem::take(&mut arg.token.lexeme);
            arg.token = Token::word(lexeme);
            out.push(arg);
            continue;
        }

        if arg.token.kind == TokenKind::Pair {
            if let Some(value) = limit_from_token(&arg.token) {
                *limit = Some(value);
                *user_limit = true;
                continue;
            }

            let (name, modifier, value) = split_pair(&arg.token.lexeme)?;
            if name == "rc" || name.starts_with("rc.") {
                out.push(arg);
                continue;
            }

            match canonical_attribute(&name, registry, minimum) {
                Some(canonical) if canonical == "limit" => {
                    if let Some(value) = limit_from_token(&Token::new(
                        format!("limit:{value}"),
                        TokenKind::Pair,
                    )) {
                        *limit = Some(value);
                        *user_limit = true;
                    }
                    continue;
                }
                Some(canonical) => {
                    if let Some(m) = &modifier
                        && !lexer::MODIFIERS.contains(&m.as_str())
                    {
                        return Err(Error::Parse(format!("unknown attribute modifier: {m}")));
                    }
                    let rebuilt = match &modifier {
                        Some(m) => format!("{canonical}.{m}:{value}"),
                        None => format!("{canonical}:{value}"),
                    };
                    let quoted = arg.token.quoted;
                    arg.token = Token::new(rebuilt, TokenKind::Pair);
                    arg.token.quoted = quoted;
                    out.push(arg);
                }
                None => {
                    // A dotted name whose base is a real attribute carries a
                    // bogus modifier rather than being ordinary text.
                    if let Some((base, suffix)) = name.rsplit_once('.')
                        && canonical_attribute(base, registry, minimum).is_some()
                    {
                        return Err(Error::Parse(format!(
                            "unknown attribute modifier: {suffix}"
                        )));
                    }
                    // Not an attribute: the pair was ordinary text.
                    let lexeme = std::mem::take(&mut arg.token.lexeme);
                    arg.token = Token::word(lexeme);
                    out.push(arg);
                }
            }
        } else {
            out.push(arg);
        }
    }

    Ok(out)
}

fn limit_from_token(token: &Token) -> Option<Limit> {
    if token.kind != TokenKind::Pair {
        return None;
    }
    let (name, value) = token.lexeme.split_once([':', '='])?;
    if name != "limit" {
        return None;
    }
    if value == "page" {
        return Some(Limit::Page);
    }
    value.parse().ok().map(Limit::Rows)
}

/// `<name>[.<mod>][:=]<value>` → (name, modifier, value).
pub(crate) fn split_pair(lexeme: &str) -> Result<(String, Option<String>, String)> {
    let (name_part, value) = lexeme
        .split_once([':', '='])
        .ok_or_else(|| Error::Parse(format!("not a name:value pair: {lexeme}")))?;

    // `rc.` names keep their dots; a trailing segment that names a known
    // modifier splits off.
    if let Some((name, modifier)) = name_part.rsplit_once('.')
        && lexer::MODIFIERS.contains(&modifier)
    {
        return Ok((name.to_string(), Some(modifier.to_string()), value.to_string()));
    }
    Ok((name_part.to_string(), None, value.to_string()))
}

/// Prefix-unique completion against pseudo-attributes and real attribute
/// names; exact matches win outright.
fn canonical_attribute(name: &str, registry: &AttributeRegistry, minimum: usize) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if registry.is_attribute(name) || name == "limit" {
        return Some(name.to_string());
    }
    if name.len() < minimum {
        return None;
    }

    let mut candidates = registry
        .names()
        .filter(|n| n.starts_with(name))
        .chain(std::iter::once("limit").filter(|n| n.starts_with(name)));
    let first = candidates.next()?;
    if candidates.next().is_some() {
        return None;
    }
    Some(first.to_string())
}

/// Wrap the span of user-typed filter tokens in parentheses.
fn parenthesize_originals(filter_args: Vec<Arg>) -> Vec<Token> {
    let first_original = filter_args.iter().position(|a| a.original);
    let last_original = filter_args.iter().rposition(|a| a.original);

    let mut out = Vec::with_capacity(filter_args.len() + 2);
    for (idx, arg) in filter_args.into_iter().enumerate() {
        if Some(idx) == first_original {
            out.push(Token::operator("("));
        }
        out.push(arg.token);
        if Some(idx) == last_original {
            out.push(Token::operator(")"));
        }
    }
    out
}

fn has_identity(tokens: &[Token]) -> bool {
    tokens.iter().any(|t| {
        matches!(
            t.kind,
            TokenKind::Number | TokenKind::Set | TokenKind::Uuid
        )
    })
}

/// The filter desugar pass: split compound words, fold the id/uuid sequence
/// into one disjunction, promote bare words to description searches, expand
/// tags, pairs and patterns into operator expressions.
fn desugar_filter(
    tokens: Vec<Token>,
    cfg: &Config,
    registry: &AttributeRegistry,
    now: DateTime<Utc>,
    dates: &DateSettings,
) -> Result<Vec<Token>> {
    let sugar = cfg.get_bool("sugar").unwrap_or(true);

    // Words that were compound argv entries split into finer tokens now. A
    // word that re-lexes to a single token stays a word: demotions are
    // final.
    let mut flat: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if token.kind == TokenKind::Word && !token.quoted {
            let finer = Lexer::lex(&token.lexeme, now, dates);
            if finer.len() > 1 {
                flat.extend(finer);
                continue;
            }
        }
        flat.push(token);
    }

    // Gather the sequence: bare ids, ranges and uuids combine into a single
    // disjunction replacing the first element.
    let mut out: Vec<Token> = Vec::new();
    if sugar {
        let mut ids: Vec<(u64, u64)> = Vec::new();
        let mut uuids: Vec<String> = Vec::new();
        let mut first_seq_index: Option<usize> = None;

        for (idx, token) in flat.iter().enumerate() {
            match token.kind {
                TokenKind::Number if token.lexeme.parse::<u64>().is_ok() => {
                    let n = token.lexeme.parse().unwrap_or(0);
                    ids.push((n, n));
                    first_seq_index.get_or_insert(idx);
                }
                TokenKind::Set => {
                    for element in token.lexeme.split(',') {
                        if let Some((a, b)) = element.split_once('-') {
                            if let (Ok(a), Ok(b)) = (a.parse(), b.parse()) {
                                ids.push((a, b));
                            }
                        } else if let Ok(n) = element.parse::<u64>() {
                            ids.push((n, n));
                        }
                    }
                    first_seq_index.get_or_insert(idx);
                }
                TokenKind::Uuid => {
                    for part in token.lexeme.split(',') {
                        uuids.push(part.to_string());
                    }
                    first_seq_index.get_or_insert(idx);
                }
                _ => {}
            }
        }

        if let Some(seq_idx) = first_seq_index {
            for (idx, token) in flat.into_iter().enumerate() {
                if idx == seq_idx {
                    out.extend(sequence_expression(&ids, &uuids));
                    continue;
                }
                if matches!(
                    token.kind,
                    TokenKind::Number | TokenKind::Set | TokenKind::Uuid
                ) {
                    continue;
                }
                out.push(token);
            }
        } else {
            out = flat;
        }
    } else {
        out = flat;
    }

    // Remaining rewrites are local per token.
    let mut rewritten: Vec<Token> = Vec::with_capacity(out.len());
    let mut prev_operator: Option<String> = None;
    for (idx, token) in out.iter().enumerate() {
        match token.kind {
            TokenKind::Tag => {
                let (sign, name) = token.lexeme.split_at(1);
                let op = if sign == "+" { "_hastag_" } else { "_notag_" };
                rewritten.push(Token::new("tags", TokenKind::Identifier));
                rewritten.push(Token::operator(op));
                rewritten.push(Token::word(name));
            }
            TokenKind::Pair => {
                rewritten.extend(pair_expression(token, registry, now, dates)?);
            }
            TokenKind::Pattern => {
                let pattern = strip_pattern(&token.lexeme);
                rewritten.push(Token::new("description", TokenKind::Identifier));
                rewritten.push(Token::operator("~"));
                rewritten.push(Token::word(pattern));
            }
            TokenKind::Word | TokenKind::Str | TokenKind::Identifier => {
                // Promote to a description search unless an operator binds
                // this token as an operand. Dotted identifiers are DOM
                // references and never promote.
                if token.kind == TokenKind::Identifier && token.lexeme.contains('.') {
                    rewritten.push(token.clone());
                    prev_operator = None;
                    continue;
                }
                let bound_left = prev_operator
                    .as_deref()
                    .map(|op| !matches!(op, "(" | ")" | "and" | "or" | "xor" | "not" | "!"))
                    .unwrap_or(false);
                let bound_right = out
                    .get(idx + 1)
                    .map(|next| {
                        next.kind == TokenKind::Operator
                            && !matches!(
                                next.lexeme.as_str(),
                                "(" | ")" | "and" | "or" | "xor"
                            )
                    })
                    .unwrap_or(false);
                if bound_left || bound_right {
                    rewritten.push(token.clone());
                } else {
                    rewritten.push(Token::new("description", TokenKind::Identifier));
                    rewritten.push(Token::operator("~"));
                    rewritten.push(token.clone());
                }
            }
            _ => rewritten.push(token.clone()),
        }

        prev_operator = if token.kind == TokenKind::Operator {
            Some(token.lexeme.clone())
        } else {
            None
        };
    }

    Ok(rewritten)
}

/// `( (id=1) or (id>=2 and id<=3) or (uuid=X) ... )`
fn sequence_expression(ids: &[(u64, u64)], uuids: &[String]) -> Vec<Token> {
    let mut out = Vec::new();
    out.push(Token::operator("("));

    let mut first = true;
    let mut join = |out: &mut Vec<Token>| {
        if !first {
            out.push(Token::operator("or"));
        }
        first = false;
    };

    for (a, b) in ids {
        join(&mut out);
        out.push(Token::operator("("));
        if a == b {
            out.push(Token::new("id", TokenKind::Identifier));
            out.push(Token::operator("="));
            out.push(Token::new(a.to_string(), TokenKind::Number));
        } else {
            out.push(Token::new("id", TokenKind::Identifier));
            out.push(Token::operator(">="));
            out.push(Token::new(a.to_string(), TokenKind::Number));
            out.push(Token::operator("and"));
            out.push(Token::new("id", TokenKind::Identifier));
            out.push(Token::operator("<="));
            out.push(Token::new(b.to_string(), TokenKind::Number));
        }
        out.push(Token::operator(")"));
    }

    for uuid in uuids {
        join(&mut out);
        out.push(Token::operator("("));
        out.push(Token::new("uuid", TokenKind::Identifier));
        if uuid.len() == 36 {
            out.push(Token::operator("="));
            out.push(Token::new(uuid.clone(), TokenKind::Uuid));
        } else {
            out.push(Token::operator("~"));
            out.push(Token::word(format!("^{uuid}")));
        }
        out.push(Token::operator(")"));
    }

    out.push(Token::operator(")"));
    out
}

/// The attribute-modifier rewrite table.
fn pair_expression(
    token: &Token,
    registry: &AttributeRegistry,
    now: DateTime<Utc>,
    dates: &DateSettings,
) -> Result<Vec<Token>> {
    let (name, modifier, value) = split_pair(&token.lexeme)?;

    let (op, rendered_value): (&str, String) = match modifier.as_deref() {
        None => ("=", value.clone()),
        Some("before") | Some("under") | Some("below") => ("<", value.clone()),
        Some("after") | Some("over") | Some("above") => (">", value.clone()),
        Some("none") => ("==", String::new()),
        Some("any") => ("!==", String::new()),
        Some("is") | Some("equals") => ("==", value.clone()),
        Some("not") => ("!=", value.clone()),
        Some("isnt") => ("!==", value.clone()),
        Some("has") | Some("contains") => ("~", value.clone()),
        Some("hasnt") => ("!~", value.clone()),
        Some("startswith") | Some("left") => ("~", format!("^{value}")),
        Some("endswith") | Some("right") => ("~", format!("{value}$")),
        Some("word") => ("~", format!("\\b{value}\\b")),
        Some("noword") => ("!~", format!("\\b{value}\\b")),
        Some(other) => {
            return Err(Error::Parse(format!("unknown attribute modifier: {other}")));
        }
    };

    let mut out = Vec::with_capacity(4);
    out.push(Token::new(name.clone(), TokenKind::Identifier));
    out.push(Token::operator(op));

    if modifier.as_deref() == Some("none") || modifier.as_deref() == Some("any") {
        let mut empty = Token::new("", TokenKind::Str);
        empty.quoted = true;
        out.push(empty);
        return Ok(out);
    }

    if token.quoted {
        let mut value_token = Token::new(rendered_value, TokenKind::Str);
        value_token.quoted = true;
        out.push(value_token);
        return Ok(out);
    }

    // Non-string attribute values may lex into a small expression of their
    // own (`due:eom+2d`); keep the pieces and parenthesize.
    let is_string = matches!(
        registry.attr_type(&name),
        Some(crate::task::AttrType::Text) | None
    );
    if !is_string {
        let value_tokens = Lexer::lex(&rendered_value, now, dates);
        if value_tokens.len() > 1 {
            out.push(Token::operator("("));
            out.extend(value_tokens);
            out.push(Token::operator(")"));
            return Ok(out);
        }
        if let Some(single) = value_tokens.into_iter().next() {
            out.push(single);
            return Ok(out);
        }
    }

    out.push(Token::word(rendered_value));
    Ok(out)
}

fn strip_pattern(lexeme: &str) -> String {
    let inner = lexeme.strip_prefix('/').unwrap_or(lexeme);
    match inner.rfind('/') {
        Some(idx) => inner[..idx].to_string(),
        None => inner.to_string(),
    }
}

/// Insert `and` between adjacent terms with no explicit connective.
fn insert_junctions(tokens: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(prev) = out.last() {
            let prev_is_value =
                prev.kind != TokenKind::Operator || prev.lexeme == ")";
            let next_is_value =
                token.kind != TokenKind::Operator || token.lexeme == "(" || token.lexeme == "!"
                    || token.lexeme == "not";
            if prev_is_value && next_is_value {
                out.push(Token::operator("and"));
            }
        }
        out.push(token);
    }
    out
}

/// Dijkstra's shunting-yard: infix tokens to postfix, honoring the
/// precedence table. Unbalanced parentheses are fatal.
pub fn shunting_yard(tokens: Vec<Token>) -> Result<Vec<Token>> {
    let mut output: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut stack: Vec<Token> = Vec::new();

    for token in tokens {
        if token.kind != TokenKind::Operator {
            output.push(token);
            continue;
        }

        match token.lexeme.as_str() {
            "(" => stack.push(token),
            ")" => {
                loop {
                    match stack.pop() {
                        Some(top) if top.lexeme == "(" => break,
                        Some(top) => output.push(top),
                        None => {
                            return Err(Error::Parse("mismatched ')' in filter".to_string()));
                        }
                    }
                }
            }
            op => {
                let (prec, assoc) = operator_info(op)
                    .ok_or_else(|| Error::Parse(format!("unknown operator: {op}")))?;
                while let Some(top) = stack.last() {
                    if top.lexeme == "(" {
                        break;
                    }
                    let (top_prec, _) = operator_info(&top.lexeme)
                        .ok_or_else(|| Error::Parse(format!("unknown operator: {}", top.lexeme)))?;
                    let pops = top_prec > prec
                        || (top_prec == prec && assoc == lexer::Assoc::Left);
                    if !pops {
                        break;
                    }
                    output.push(stack.pop().unwrap_or_else(|| Token::operator("")));
                }
                stack.push(token);
            }
        }
    }

    while let Some(top) = stack.pop() {
        if top.lexeme == "(" {
            return Err(Error::Parse("mismatched '(' in filter".to_string()));
        }
        output.push(top);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use chrono::{TimeZone, Utc};

    use super::{Invocation, Limit, preprocess_args, shunting_yard};
    use crate::commands::CommandKind;
    use crate::config::Config;
    use crate::dates::DateSettings;
    use crate::lexer::Lexer;
    use crate::task::AttributeRegistry;

    fn fixed_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 18, 12, 0, 0).unwrap()
    }

    fn parse(cfg: &Config, args: &[&str]) -> Invocation {
        let registry = AttributeRegistry::from_config(cfg);
        Invocation::parse(
            cfg,
            &registry,
            "/usr/bin/task",
            args.iter().map(OsString::from).collect(),
            fixed_now(),
        )
        .expect("parse invocation")
    }

    fn postfix_text(inv: &Invocation) -> String {
        inv.filter
            .iter()
            .map(|t| t.lexeme.clone())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn add_collects_modifications() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["add", "project:home", "+urgent", "Buy", "milk"]);
        assert_eq!(inv.command, CommandKind::Add);
        assert!(inv.filter.is_empty());
        let mods: Vec<&str> = inv.modifications.iter().map(|t| t.lexeme.as_str()).collect();
        assert_eq!(mods, vec!["project:home", "+urgent", "Buy", "milk"]);
    }

    #[test]
    fn dashed_words_in_add_are_not_tag_removals() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["add", "Read", "-", "the", "-dashed", "word"]);
        let mods: Vec<&str> = inv.modifications.iter().map(|t| t.lexeme.as_str()).collect();
        assert!(mods.contains(&"-dashed"));
        assert!(
            inv.modifications
                .iter()
                .all(|t| t.kind != crate::lexer::TokenKind::Tag)
        );
    }

    #[test]
    fn filter_before_command_modifications_after() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["project:home", "modify", "priority:H"]);
        assert_eq!(inv.command, CommandKind::Modify);
        let post = postfix_text(&inv);
        assert!(post.contains("project"), "filter text: {post}");
        let mods: Vec<&str> = inv.modifications.iter().map(|t| t.lexeme.as_str()).collect();
        assert_eq!(mods, vec!["priority:H"]);
    }

    #[test]
    fn sequence_desugars_to_id_disjunction() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["1,3-5", "done"]);
        let post = postfix_text(&inv);
        assert!(post.contains("id"), "postfix: {post}");
        assert!(post.contains("or"), "postfix: {post}");
        assert!(post.contains(">="), "postfix: {post}");
    }

    #[test]
    fn bare_sequence_defaults_to_information() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["42"]);
        assert_eq!(inv.command, CommandKind::Information);
        assert!(postfix_text(&inv).contains("id"));
    }

    #[test]
    fn default_command_is_injected() {
        let mut cfg = Config::defaults();
        cfg.set("default.command", "list");
        let inv = parse(&cfg, &[]);
        assert_eq!(inv.command, CommandKind::List);
    }

    #[test]
    fn trivial_input_without_default_fails() {
        let mut cfg = Config::defaults();
        cfg.set("default.command", "");
        let registry = AttributeRegistry::from_config(&cfg);
        let err = Invocation::parse(&cfg, &registry, "task", vec![], fixed_now());
        assert!(err.is_err());
    }

    #[test]
    fn tags_desugar_to_hastag() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["+home", "-work", "list"]);
        let post = postfix_text(&inv);
        assert!(post.contains("_hastag_"), "postfix: {post}");
        assert!(post.contains("_notag_"), "postfix: {post}");
    }

    #[test]
    fn pair_modifiers_rewrite_to_operators() {
        let cfg = Config::defaults();

        let inv = parse(&cfg, &["due.before:2026-06-01", "list"]);
        assert!(postfix_text(&inv).contains("<"));

        let inv = parse(&cfg, &["project.none:", "list"]);
        assert!(postfix_text(&inv).contains("=="));

        let inv = parse(&cfg, &["description.startswith:Buy", "list"]);
        assert!(postfix_text(&inv).contains("^Buy"));

        let inv = parse(&cfg, &["project.word:home", "list"]);
        assert!(postfix_text(&inv).contains("\\bhome\\b"));
    }

    #[test]
    fn unknown_modifier_is_fatal() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let result = Invocation::parse(
            &cfg,
            &registry,
            "task",
            vec![OsString::from("due.sideways:tomorrow"), OsString::from("list")],
            fixed_now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn attribute_names_complete_by_unique_prefix() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["proj:home", "list"]);
        assert!(postfix_text(&inv).contains("project"));

        // Ambiguous or unknown prefixes demote to description words.
        let inv = parse(&cfg, &["zebra:stripes", "list"]);
        let post = postfix_text(&inv);
        assert!(post.contains("description"), "postfix: {post}");
    }

    #[test]
    fn bare_words_promote_to_description_search() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["groceries", "list"]);
        let post = postfix_text(&inv);
        assert!(post.contains("description"));
        assert!(post.contains("~"));
    }

    #[test]
    fn patterns_promote_to_description_match() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["/needle/", "list"]);
        let post = postfix_text(&inv);
        assert!(post.contains("description"));
        assert!(post.contains("needle"));
    }

    #[test]
    fn alias_expansion_and_pass_cap() {
        let mut cfg = Config::defaults();
        cfg.set("alias.rm", "delete");
        let inv = parse(&cfg, &["rm", "42"]);
        assert_eq!(inv.command, CommandKind::Delete);

        cfg.set("alias.loop", "loop");
        let inv = parse(&cfg, &["loop", "42"]);
        assert!(!inv.diagnostics.is_empty());
        assert_eq!(inv.command, CommandKind::Information);
    }

    #[test]
    fn limit_pair_is_consumed() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["limit:20", "list"]);
        assert_eq!(inv.limit, Some(Limit::Rows(20)));
        assert!(!postfix_text(&inv).contains("limit"));

        let inv = parse(&cfg, &["limit:page", "list"]);
        assert_eq!(inv.limit, Some(Limit::Page));
    }

    #[test]
    fn context_applies_unless_identity_present() {
        let mut cfg = Config::defaults();
        cfg.set("context", "work");
        cfg.set("context.work", "project:acme");
        let inv = parse(&cfg, &["list"]);
        assert!(postfix_text(&inv).contains("acme"));

        // An id filter switches the context off.
        let inv = parse(&cfg, &["42", "list"]);
        assert!(!postfix_text(&inv).contains("acme"));
    }

    #[test]
    fn user_limit_beats_context_limit() {
        let mut cfg = Config::defaults();
        cfg.set("context", "work");
        cfg.set("context.work", "project:acme limit:5");
        let inv = parse(&cfg, &["limit:20", "list"]);
        assert_eq!(inv.limit, Some(Limit::Rows(20)));

        let inv = parse(&cfg, &["list"]);
        assert_eq!(inv.limit, Some(Limit::Rows(5)));
    }

    #[test]
    fn terminated_arguments_stay_words() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["add", "--", "+notatag", "project:keeps"]);
        let mods: Vec<&str> = inv.modifications.iter().map(|t| t.lexeme.as_str()).collect();
        assert_eq!(mods, vec!["+notatag", "project:keeps"]);
    }

    #[test]
    fn shunting_yard_respects_precedence() {
        let tokens = Lexer::lex(
            "a = 1 or b = 2 and c = 3",
            fixed_now(),
            &DateSettings::default(),
        );
        let postfix = shunting_yard(tokens).expect("convert");
        let text: Vec<&str> = postfix.iter().map(|t| t.lexeme.as_str()).collect();
        // and binds tighter than or.
        assert_eq!(
            text,
            vec!["a", "1", "=", "b", "2", "=", "c", "3", "=", "and", "or"]
        );
    }

    #[test]
    fn mismatched_parentheses_are_fatal() {
        let tokens = Lexer::lex("( a = 1", fixed_now(), &DateSettings::default());
        assert!(shunting_yard(tokens).is_err());

        let tokens = Lexer::lex("a = 1 )", fixed_now(), &DateSettings::default());
        assert!(shunting_yard(tokens).is_err());
    }

    #[test]
    fn preprocess_captures_rc_forms() {
        let raw: Vec<OsString> = ["task", "rc:/tmp/other.rc", "rc.gc=off", "list"]
            .iter()
            .map(OsString::from)
            .collect();
        let pre = preprocess_args(&raw).expect("preprocess");
        assert_eq!(pre.taskrc_file, Some(std::path::PathBuf::from("/tmp/other.rc")));
        assert_eq!(
            pre.rc_overrides,
            vec![("rc.gc".to_string(), "off".to_string())]
        );
        let cleaned: Vec<String> = pre
            .cleaned_args
            .iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect();
        assert_eq!(cleaned, vec!["task", "list"]);
    }

    #[test]
    fn parenthesized_expression_filters() {
        let cfg = Config::defaults();
        let inv = parse(&cfg, &["(project:home", "or", "project:work)", "list"]);
        let post = postfix_text(&inv);
        assert!(post.contains("or"), "postfix: {post}");
        assert!(post.contains("home"), "postfix: {post}");
        assert!(post.contains("work"), "postfix: {post}");
    }
}
