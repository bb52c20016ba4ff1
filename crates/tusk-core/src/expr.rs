use chrono::{DateTime, Local, Timelike, Utc};
use regex::RegexBuilder;
use tracing::trace;

use crate::dates;
use crate::dom::{self, DomContext};
use crate::error::{Error, Result};
use crate::lexer::{Token, TokenKind};
use crate::task::Task;

/// The value domain of the filter language.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Date(DateTime<Utc>),
    /// Seconds.
    Dur(i64),
    Bool(bool),
    None,
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0,
            Value::Date(_) => true,
            Value::Dur(d) => *d != 0,
            Value::Bool(b) => *b,
            Value::None => false,
        }
    }

    fn as_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Date(dt) => dt.timestamp().to_string(),
            Value::Dur(d) => d.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::None => String::new(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.parse().ok(),
            Value::Dur(d) => Some(*d as f64),
            Value::Date(dt) => Some(dt.timestamp() as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::None => None,
        }
    }
}

/// Evaluation settings drawn from configuration once per invocation.
pub struct EvalSettings {
    pub case_sensitive: bool,
    pub regex: bool,
}

/// The virtual tag vocabulary; evaluated against task state rather than the
/// literal tag set.
const VIRTUAL_TAGS: &[&str] = &[
    "PENDING", "COMPLETED", "DELETED", "RECURRING", "WAITING", "ACTIVE", "BLOCKED", "UNBLOCKED",
    "OVERDUE", "DUE", "TODAY", "TOMORROW", "TAGGED", "ANNOTATED",
];

pub fn is_virtual_tag(name: &str) -> bool {
    VIRTUAL_TAGS.contains(&name)
}

/// Evaluate a postfix token sequence against one task. A stack machine:
/// literals and DOM lookups push, operators pop and push, and exactly one
/// value must remain.
pub fn evaluate(
    postfix: &[Token],
    task: &Task,
    ctx: &DomContext<'_>,
    settings: &EvalSettings,
) -> Result<Value> {
    let mut stack: Vec<Value> = Vec::with_capacity(8);

    for token in postfix {
        match token.kind {
            TokenKind::Operator => apply_operator(&token.lexeme, &mut stack, task, ctx, settings)?,
            TokenKind::Number => {
                let n: f64 = token
                    .lexeme
                    .parse()
                    .map_err(|_| Error::Parse(format!("not a number: {}", token.lexeme)))?;
                stack.push(Value::Num(n));
            }
            TokenKind::Date => {
                let dt = dates::parse_date(&token.lexeme, ctx.now, &date_settings(ctx))
                    .ok_or_else(|| Error::Parse(format!("not a date: {}", token.lexeme)))?;
                stack.push(Value::Date(dt));
            }
            TokenKind::Duration => {
                let dur: crate::duration::Duration = token
                    .lexeme
                    .parse()
                    .map_err(|_| Error::Parse(format!("not a duration: {}", token.lexeme)))?;
                stack.push(Value::Dur(dur.seconds()));
            }
            TokenKind::Identifier => {
                stack.push(dom::resolve(&token.lexeme, task, ctx));
            }
            TokenKind::Uuid | TokenKind::Word | TokenKind::Str | TokenKind::Tag => {
                stack.push(Value::Str(token.lexeme.clone()));
            }
            other => {
                return Err(Error::Parse(format!(
                    "unexpected {:?} token in expression: {}",
                    other, token.lexeme
                )));
            }
        }
    }

    if stack.len() != 1 {
        return Err(Error::Parse(format!(
            "malformed expression: {} values left on the stack",
            stack.len()
        )));
    }
    let result = stack.remove(0);
    trace!(?result, uuid = task.uuid(), "expression evaluated");
    Ok(result)
}

/// Evaluate and coerce to a boolean.
pub fn matches(
    postfix: &[Token],
    task: &Task,
    ctx: &DomContext<'_>,
    settings: &EvalSettings,
) -> Result<bool> {
    if postfix.is_empty() {
        return Ok(true);
    }
    Ok(evaluate(postfix, task, ctx, settings)?.truthy())
}

fn date_settings(ctx: &DomContext<'_>) -> dates::DateSettings {
    let mut settings = dates::DateSettings::default();
    if let Some(fmt) = ctx.cfg.get("dateformat") {
        settings.dateformat = fmt;
    }
    if let Some(ws) = ctx.cfg.get("weekstart")
        && ws.eq_ignore_ascii_case("monday")
    {
        settings.weekstart = chrono::Weekday::Mon;
    }
    settings
}

fn apply_operator(
    op: &str,
    stack: &mut Vec<Value>,
    task: &Task,
    ctx: &DomContext<'_>,
    settings: &EvalSettings,
) -> Result<()> {
    if op == "!" || op == "not" {
        let operand = pop(stack, op)?;
        stack.push(Value::Bool(!operand.truthy()));
        return Ok(());
    }

    let right = pop(stack, op)?;
    let left = pop(stack, op)?;

    let result = match op {
        "+" => arith_add(&left, &right)?,
        "-" => arith_sub(&left, &right)?,
        "*" => {
            let (a, b) = numbers(&left, &right, op)?;
            Value::Num(a * b)
        }
        "/" => {
            let (a, b) = numbers(&left, &right, op)?;
            Value::Num(a / b)
        }
        "<" | "<=" | ">" | ">=" => compare_order(op, &left, &right),
        "=" => Value::Bool(loose_equal(&left, &right, settings)),
        "!=" => Value::Bool(!loose_equal(&left, &right, settings)),
        "==" => Value::Bool(strict_equal(&left, &right)),
        "!==" => Value::Bool(!strict_equal(&left, &right)),
        "~" => Value::Bool(text_match(&left, &right, settings)?),
        "!~" => Value::Bool(!text_match(&left, &right, settings)?),
        "_hastag_" => Value::Bool(has_tag(task, &right, ctx)),
        "_notag_" => Value::Bool(!has_tag(task, &right, ctx)),
        "and" => Value::Bool(left.truthy() && right.truthy()),
        "or" => Value::Bool(left.truthy() || right.truthy()),
        "xor" => Value::Bool(left.truthy() ^ right.truthy()),
        other => return Err(Error::Parse(format!("unknown operator: {other}"))),
    };

    stack.push(result);
    Ok(())
}

fn pop(stack: &mut Vec<Value>, op: &str) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| Error::Parse(format!("missing operand for '{op}'")))
}

fn numbers(left: &Value, right: &Value, op: &str) -> Result<(f64, f64)> {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::Parse(format!("'{op}' needs numeric operands"))),
    }
}

fn arith_add(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Date(dt), Value::Dur(d)) | (Value::Dur(d), Value::Date(dt)) => {
            Ok(Value::Date(dates::add_duration(*dt, *d)))
        }
        (Value::Dur(a), Value::Dur(b)) => Ok(Value::Dur(a + b)),
        _ => {
            let (a, b) = numbers(left, right, "+")?;
            Ok(Value::Num(a + b))
        }
    }
}

fn arith_sub(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Date(dt), Value::Dur(d)) => Ok(Value::Date(dates::add_duration(*dt, -d))),
        (Value::Date(a), Value::Date(b)) => Ok(Value::Dur((*a - *b).num_seconds())),
        (Value::Dur(a), Value::Dur(b)) => Ok(Value::Dur(a - b)),
        _ => {
            let (a, b) = numbers(left, right, "-")?;
            Ok(Value::Num(a - b))
        }
    }
}

fn compare_order(op: &str, left: &Value, right: &Value) -> Value {
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Date(a), Value::Date(b)) => a.cmp(b),
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => {
                if a < b {
                    std::cmp::Ordering::Less
                } else if a > b {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            }
            // Empty sorts before everything.
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        },
    };

    let ok = match op {
        "<" => ordering == std::cmp::Ordering::Less,
        "<=" => ordering != std::cmp::Ordering::Greater,
        ">" => ordering == std::cmp::Ordering::Greater,
        ">=" => ordering != std::cmp::Ordering::Less,
        _ => false,
    };
    Value::Bool(ok)
}

/// `=` equality: strings honor `search.case.sensitive`; a date compared to a
/// midnight-exact literal compares by day; durations by total seconds.
fn loose_equal(left: &Value, right: &Value, settings: &EvalSettings) -> bool {
    match (left, right) {
        (Value::Date(a), Value::Date(b)) => {
            if is_midnight(*b) || is_midnight(*a) {
                dates::same_day(*a, *b)
            } else {
                a == b
            }
        }
        (Value::Dur(a), Value::Dur(b)) => a == b,
        (Value::None, Value::None) => true,
        (Value::None, other) | (other, Value::None) => !other.truthy(),
        _ => {
            let a = left.as_text();
            let b = right.as_text();
            if settings.case_sensitive {
                a == b
            } else {
                a.eq_ignore_ascii_case(&b)
            }
        }
    }
}

/// `==` is strict: case-sensitive, instant-precise, no day rounding.
fn strict_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Date(a), Value::Date(b)) => a == b,
        (Value::None, Value::None) => true,
        (Value::None, other) | (other, Value::None) => !other.truthy(),
        _ => left.as_text() == right.as_text(),
    }
}

fn is_midnight(dt: DateTime<Utc>) -> bool {
    let local = dt.with_timezone(&Local);
    local.hour() == 0 && local.minute() == 0 && local.second() == 0
}

fn text_match(left: &Value, right: &Value, settings: &EvalSettings) -> Result<bool> {
    let haystack = left.as_text();
    let needle = right.as_text();

    if settings.regex {
        let re = RegexBuilder::new(&needle)
            .case_insensitive(!settings.case_sensitive)
            .build()
            .map_err(|e| Error::Parse(format!("bad regex '{needle}': {e}")))?;
        return Ok(re.is_match(&haystack));
    }

    if settings.case_sensitive {
        Ok(haystack.contains(&needle))
    } else {
        Ok(haystack.to_lowercase().contains(&needle.to_lowercase()))
    }
}

/// `_hastag_` membership; ALL-CAPS names from the virtual vocabulary test
/// task state instead of the literal tag set.
fn has_tag(task: &Task, right: &Value, ctx: &DomContext<'_>) -> bool {
    let tag = right.as_text();
    if is_virtual_tag(&tag) {
        return eval_virtual_tag(&tag, task, ctx);
    }
    task.has_tag(&tag)
}

fn eval_virtual_tag(tag: &str, task: &Task, ctx: &DomContext<'_>) -> bool {
    use crate::task::Status;

    let now = ctx.now;
    match tag {
        "PENDING" => task.status() == Status::Pending,
        "COMPLETED" => task.status() == Status::Completed,
        "DELETED" => task.status() == Status::Deleted,
        "RECURRING" => task.status() == Status::Recurring,
        "WAITING" => task.status() == Status::Waiting,
        "ACTIVE" => task.has("start"),
        "BLOCKED" => ctx.source.map(|s| s.is_blocked(task)).unwrap_or(false),
        "UNBLOCKED" => !ctx.source.map(|s| s.is_blocked(task)).unwrap_or(false),
        "OVERDUE" => task.get_date("due").map(|due| due < now).unwrap_or(false),
        "DUE" => task
            .get_date("due")
            .map(|due| due <= now + chrono::Duration::days(7))
            .unwrap_or(false),
        "TODAY" => task
            .get_date("due")
            .map(|due| dates::same_day(due, now))
            .unwrap_or(false),
        "TOMORROW" => task
            .get_date("due")
            .map(|due| dates::same_day(due, now + chrono::Duration::days(1)))
            .unwrap_or(false),
        "TAGGED" => !task.tags().is_empty(),
        "ANNOTATED" => task.annotation_count() > 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{EvalSettings, Value, evaluate, matches};
    use crate::config::Config;
    use crate::dates::DateSettings;
    use crate::dom::DomContext;
    use crate::lexer::Lexer;
    use crate::task::{AttributeRegistry, Status, Task};

    fn fixed_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 18, 12, 0, 0).unwrap()
    }

    fn settings() -> EvalSettings {
        EvalSettings {
            case_sensitive: true,
            regex: true,
        }
    }

    fn postfix(expr: &str) -> Vec<crate::lexer::Token> {
        // Tests build postfix through the same shunting-yard the parser
        // uses, via the cli module.
        let tokens = Lexer::lex(expr, fixed_now(), &DateSettings::default());
        crate::cli::shunting_yard(tokens).expect("postfix conversion")
    }

    fn sample() -> Task {
        let mut task = Task::new();
        task.set("uuid", "a0b1c2d3-0000-4000-8000-000000000000");
        task.set("description", "Buy milk at the store");
        task.set_status(Status::Pending);
        task.set("project", "home");
        task.set("tags", "urgent,errand");
        task
    }

    fn ctx<'a>(cfg: &'a Config, registry: &'a AttributeRegistry) -> DomContext<'a> {
        DomContext {
            cfg,
            registry,
            now: fixed_now(),
            source: None,
        }
    }

    #[test]
    fn arithmetic_and_comparison() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = sample();
        let c = ctx(&cfg, &registry);

        assert_eq!(
            evaluate(&postfix("1 + 2 * 3"), &task, &c, &settings()).expect("eval"),
            Value::Num(7.0)
        );
        assert!(matches(&postfix("2 < 3"), &task, &c, &settings()).expect("eval"));
        assert!(!matches(&postfix("2 >= 3"), &task, &c, &settings()).expect("eval"));
    }

    #[test]
    fn attribute_equality_and_regex() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = sample();
        let c = ctx(&cfg, &registry);

        assert!(matches(&postfix("project = home"), &task, &c, &settings()).expect("eval"));
        assert!(matches(&postfix("description ~ milk"), &task, &c, &settings()).expect("eval"));
        assert!(!matches(&postfix("description ~ cheese"), &task, &c, &settings()).expect("eval"));
        assert!(
            matches(&postfix("description ~ \\bmilk\\b"), &task, &c, &settings()).expect("eval")
        );
    }

    #[test]
    fn boolean_connectives() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = sample();
        let c = ctx(&cfg, &registry);

        assert!(
            matches(
                &postfix("project = home and description ~ milk"),
                &task,
                &c,
                &settings()
            )
            .expect("eval")
        );
        assert!(
            matches(
                &postfix("project = work or description ~ milk"),
                &task,
                &c,
                &settings()
            )
            .expect("eval")
        );
        assert!(
            !matches(
                &postfix("project = home xor description ~ milk"),
                &task,
                &c,
                &settings()
            )
            .expect("eval")
        );
        assert!(matches(&postfix("! ( project = work )"), &task, &c, &settings()).expect("eval"));
    }

    #[test]
    fn tag_membership() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = sample();
        let c = ctx(&cfg, &registry);

        assert!(matches(&postfix("tags _hastag_ urgent"), &task, &c, &settings()).expect("eval"));
        assert!(!matches(&postfix("tags _hastag_ nope"), &task, &c, &settings()).expect("eval"));
        assert!(matches(&postfix("tags _notag_ nope"), &task, &c, &settings()).expect("eval"));
    }

    #[test]
    fn virtual_tags() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let mut task = sample();
        task.set("due", (fixed_now().timestamp() - 86400).to_string());
        let c = ctx(&cfg, &registry);

        assert!(matches(&postfix("tags _hastag_ PENDING"), &task, &c, &settings()).expect("eval"));
        assert!(matches(&postfix("tags _hastag_ OVERDUE"), &task, &c, &settings()).expect("eval"));
        assert!(matches(&postfix("tags _hastag_ TAGGED"), &task, &c, &settings()).expect("eval"));
        assert!(
            !matches(&postfix("tags _hastag_ ANNOTATED"), &task, &c, &settings()).expect("eval")
        );
    }

    #[test]
    fn date_day_equality_is_loose_instant_equality_is_strict() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let mut task = sample();
        // Mid-day due time.
        task.set("due", fixed_now().timestamp().to_string());
        let c = ctx(&cfg, &registry);

        // `=` against a bare date literal matches anywhere on that day.
        assert!(matches(&postfix("due = 2026-03-18"), &task, &c, &settings()).expect("eval"));
        // `==` wants the instant.
        assert!(!matches(&postfix("due == 2026-03-18"), &task, &c, &settings()).expect("eval"));
    }

    #[test]
    fn case_sensitivity_honors_settings() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = sample();
        let c = ctx(&cfg, &registry);

        let insensitive = EvalSettings {
            case_sensitive: false,
            regex: true,
        };
        assert!(matches(&postfix("project = HOME"), &task, &c, &insensitive).expect("eval"));
        assert!(!matches(&postfix("project = HOME"), &task, &c, &settings()).expect("eval"));
        // `==` stays strict either way.
        assert!(!matches(&postfix("project == HOME"), &task, &c, &insensitive).expect("eval"));
    }

    #[test]
    fn substring_match_when_regex_off() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = sample();
        let c = ctx(&cfg, &registry);

        let no_regex = EvalSettings {
            case_sensitive: true,
            regex: false,
        };
        assert!(matches(&postfix("description ~ milk"), &task, &c, &no_regex).expect("eval"));
        // Metacharacters are literal without regex.
        assert!(!matches(&postfix("description ~ m.lk"), &task, &c, &no_regex).expect("eval"));
    }

    #[test]
    fn empty_values_are_false() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = sample();
        let c = ctx(&cfg, &registry);

        // Missing attribute == '' is how `name.none:` desugars.
        assert!(matches(&postfix("priority == ''"), &task, &c, &settings()).expect("eval"));
        assert!(!matches(&postfix("priority !== ''"), &task, &c, &settings()).expect("eval"));
    }

    #[test]
    fn date_plus_duration() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let mut task = sample();
        task.set("due", fixed_now().timestamp().to_string());
        let c = ctx(&cfg, &registry);

        assert!(matches(&postfix("due < now + 2d"), &task, &c, &settings()).expect("eval"));
    }
}
