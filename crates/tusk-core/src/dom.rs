use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::expr::Value;
use crate::task::{AttrType, AttributeRegistry, Task};

/// Read-only access to other tasks during expression evaluation, for the
/// `<id>.<attr>` and `<uuid>.<attr>` reference forms and the blocked /
/// blocking virtual state.
pub trait DomSource {
    fn task_by_id(&self, id: u64) -> Option<Task>;
    fn task_by_uuid(&self, uuid: &str) -> Option<Task>;
    fn is_blocked(&self, task: &Task) -> bool;
    fn is_blocking(&self, task: &Task) -> bool;
}

/// Everything name resolution can see. A missing attribute resolves to the
/// empty value, never an error.
pub struct DomContext<'a> {
    pub cfg: &'a Config,
    pub registry: &'a AttributeRegistry,
    pub now: DateTime<Utc>,
    pub source: Option<&'a dyn DomSource>,
}

pub fn resolve(name: &str, task: &Task, ctx: &DomContext<'_>) -> Value {
    if name == "now" {
        return Value::Date(ctx.now);
    }

    if let Some(rest) = name.strip_prefix("rc.") {
        return match ctx.cfg.get(rest) {
            Some(value) => Value::Str(value),
            None => Value::None,
        };
    }

    // `<id>.<attr>` / `<uuid>.<attr>` cross-references.
    if let Some((reference, attr)) = name.split_once('.') {
        if let Ok(id) = reference.parse::<u64>() {
            return match ctx.source.and_then(|s| s.task_by_id(id)) {
                Some(other) => attribute_value(&other, attr, ctx),
                None => Value::None,
            };
        }
        if reference.len() >= 8 && reference.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return match ctx.source.and_then(|s| s.task_by_uuid(reference)) {
                Some(other) => attribute_value(&other, attr, ctx),
                None => Value::None,
            };
        }
    }

    attribute_value(task, name, ctx)
}

pub fn attribute_value(task: &Task, name: &str, ctx: &DomContext<'_>) -> Value {
    match name {
        "id" => {
            return if task.id > 0 {
                Value::Num(task.id as f64)
            } else {
                Value::None
            };
        }
        "urgency" => {
            return match task.urgency_cached() {
                Some(value) => Value::Num(value),
                None => Value::None,
            };
        }
        _ => {}
    }

    // A name outside the attribute namespace is an unquoted literal, so
    // `project = home` compares against the string "home".
    if ctx.registry.attr_type(name).is_none() {
        return Value::Str(name.to_string());
    }

    if !task.has(name) {
        return Value::None;
    }

    match ctx.registry.attr_type(name) {
        Some(AttrType::Date) => task.get_date(name).map(Value::Date).unwrap_or(Value::None),
        Some(AttrType::DurationVal) => task
            .get_duration(name)
            .map(|d| Value::Dur(d.seconds()))
            .unwrap_or(Value::None),
        Some(AttrType::Numeric) => task
            .get(name)
            .and_then(|v| v.parse().ok())
            .map(Value::Num)
            .unwrap_or(Value::None),
        _ => Value::Str(task.get(name).unwrap_or("").to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{DomContext, resolve};
    use crate::config::Config;
    use crate::expr::Value;
    use crate::task::{AttributeRegistry, Task};

    fn ctx<'a>(cfg: &'a Config, registry: &'a AttributeRegistry) -> DomContext<'a> {
        DomContext {
            cfg,
            registry,
            now: Utc.with_ymd_and_hms(2026, 3, 18, 12, 0, 0).unwrap(),
            source: None,
        }
    }

    #[test]
    fn missing_attributes_are_empty_unknown_names_are_literals() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = Task::new();
        assert_eq!(resolve("project", &task, &ctx(&cfg, &registry)), Value::None);
        assert_eq!(
            resolve("nosuch", &task, &ctx(&cfg, &registry)),
            Value::Str("nosuch".to_string())
        );
    }

    #[test]
    fn typed_resolution() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let mut task = Task::new();
        task.set("description", "words");
        task.set("due", "1750000000");
        task.set("recur", "weekly");

        let c = ctx(&cfg, &registry);
        assert!(matches!(resolve("description", &task, &c), Value::Str(_)));
        assert!(matches!(resolve("due", &task, &c), Value::Date(_)));
        assert_eq!(resolve("recur", &task, &c), Value::Dur(7 * 86400));
    }

    #[test]
    fn rc_references_read_configuration() {
        let mut cfg = Config::defaults();
        cfg.set("special.key", "special value");
        let registry = AttributeRegistry::from_config(&cfg);
        let task = Task::new();
        assert_eq!(
            resolve("rc.special.key", &task, &ctx(&cfg, &registry)),
            Value::Str("special value".to_string())
        );
    }

    #[test]
    fn now_is_a_runtime_reference() {
        let cfg = Config::defaults();
        let registry = AttributeRegistry::from_config(&cfg);
        let task = Task::new();
        let c = ctx(&cfg, &registry);
        assert_eq!(resolve("now", &task, &c), Value::Date(c.now));
    }
}
