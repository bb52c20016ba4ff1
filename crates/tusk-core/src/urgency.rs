use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::task::{Status, Task};

/// Coefficients within epsilon of zero contribute nothing and their term is
/// never computed.
const EPSILON: f64 = 1e-6;

/// Per-task inputs the polynomial needs beyond the task itself.
pub struct UrgencyInputs {
    pub now: DateTime<Utc>,
    pub is_blocked: bool,
    pub is_blocking: bool,
}

/// The urgency polynomial: a sum of weighted terms, each term in [0, 1],
/// with coefficients from `urgency.<term>.coefficient`. The result is
/// cached on the task; any attribute mutation invalidates it.
pub fn urgency(task: &Task, cfg: &Config, inputs: &UrgencyInputs) -> f64 {
    if let Some(cached) = task.urgency_cached() {
        return cached;
    }

    let mut value = 0.0;
    let mut term = |name: &str, term_value: f64| {
        let coefficient = cfg
            .get_real(&format!("urgency.{name}.coefficient"))
            .unwrap_or(0.0);
        if coefficient.abs() > EPSILON {
            value += term_value * coefficient;
        }
    };

    term("priority", priority_term(task));
    term("project", if task.has("project") { 1.0 } else { 0.0 });
    term("active", if task.has("start") { 1.0 } else { 0.0 });
    term("scheduled", scheduled_term(task, inputs.now));
    term(
        "waiting",
        if task.status() == Status::Waiting { 1.0 } else { 0.0 },
    );
    term("blocked", if inputs.is_blocked { 1.0 } else { 0.0 });
    term("blocking", if inputs.is_blocking { 1.0 } else { 0.0 });
    term("annotations", count_term(task.annotation_count()));
    term("tags", count_term(task.tags().len()));
    term("next", if task.has_tag("next") { 1.0 } else { 0.0 });
    term("due", due_term(task, inputs.now));
    term("age", age_term(task, cfg, inputs.now));

    // Project-, tag- and UDA-specific coefficients add their weight
    // directly, unnormalized.
    for key in cfg.keys_with_prefix("urgency.user.project.") {
        if let Some(project) = key
            .strip_prefix("urgency.user.project.")
            .and_then(|rest| rest.strip_suffix(".coefficient"))
        {
            let coefficient = cfg.get_real(&key).unwrap_or(0.0);
            if coefficient.abs() > EPSILON
                && task
                    .get("project")
                    .map(|p| p.starts_with(project))
                    .unwrap_or(false)
            {
                value += coefficient;
            }
        }
    }

    for key in cfg.keys_with_prefix("urgency.user.tag.") {
        if let Some(tag) = key
            .strip_prefix("urgency.user.tag.")
            .and_then(|rest| rest.strip_suffix(".coefficient"))
        {
            let coefficient = cfg.get_real(&key).unwrap_or(0.0);
            if coefficient.abs() > EPSILON && task.has_tag(tag) {
                value += coefficient;
            }
        }
    }

    for key in cfg.keys_with_prefix("urgency.uda.") {
        if let Some(name) = key
            .strip_prefix("urgency.uda.")
            .and_then(|rest| rest.strip_suffix(".coefficient"))
        {
            let coefficient = cfg.get_real(&key).unwrap_or(0.0);
            if coefficient.abs() > EPSILON && task.has(name) {
                value += coefficient;
            }
        }
    }

    task.cache_urgency(value);
    value
}

fn priority_term(task: &Task) -> f64 {
    match task.get("priority") {
        Some("H") => 1.0,
        Some("M") => 0.65,
        Some("L") => 0.3,
        _ => 0.0,
    }
}

fn scheduled_term(task: &Task, now: DateTime<Utc>) -> f64 {
    match task.get_date("scheduled") {
        Some(scheduled) if scheduled <= now => 1.0,
        _ => 0.0,
    }
}

fn count_term(count: usize) -> f64 {
    match count {
        0 => 0.0,
        1 => 0.8,
        2 => 0.9,
        _ => 1.0,
    }
}

/// Map the three weeks around the due date onto [0.2, 1.0]: a week or more
/// overdue pins at 1.0, more than two weeks out pins at 0.2.
fn due_term(task: &Task, now: DateTime<Utc>) -> f64 {
    let Some(due) = task.get_date("due") else {
        return 0.0;
    };
    let days_overdue = (now - due).num_seconds() as f64 / 86_400.0;
    if days_overdue >= 7.0 {
        1.0
    } else if days_overdue >= -14.0 {
        ((days_overdue + 14.0) * 0.8 / 21.0) + 0.2
    } else {
        0.2
    }
}

fn age_term(task: &Task, cfg: &Config, now: DateTime<Utc>) -> f64 {
    let Some(entry) = task.get_date("entry") else {
        return 1.0;
    };
    let age_days = (now - entry).num_seconds() as f64 / 86_400.0;
    let max = cfg.get_real("urgency.age.max").unwrap_or(365.0);
    if max <= 0.0 {
        return 1.0;
    }
    (age_days / max).min(1.0)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{UrgencyInputs, urgency};
    use crate::config::Config;
    use crate::task::{Status, Task};

    fn fixed_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 18, 12, 0, 0).unwrap()
    }

    fn inputs() -> UrgencyInputs {
        UrgencyInputs {
            now: fixed_now(),
            is_blocked: false,
            is_blocking: false,
        }
    }

    /// Configuration with every coefficient zeroed, so tests can enable one
    /// term at a time.
    fn silent_config() -> Config {
        let mut cfg = Config::defaults();
        for term in [
            "priority",
            "project",
            "active",
            "scheduled",
            "waiting",
            "blocked",
            "blocking",
            "annotations",
            "tags",
            "next",
            "due",
            "age",
        ] {
            cfg.set(&format!("urgency.{term}.coefficient"), "0");
        }
        cfg
    }

    fn bare_task() -> Task {
        let mut task = Task::new();
        task.set("uuid", "11111111-0000-4000-8000-000000000001");
        task.set("description", "something");
        task.set_status(Status::Pending);
        task
    }

    #[test]
    fn priority_weights() {
        let mut cfg = silent_config();
        cfg.set("urgency.priority.coefficient", "6.0");

        for (priority, expected) in [("H", 6.0), ("M", 3.9), ("L", 1.8)] {
            let mut task = bare_task();
            task.set("priority", priority);
            let value = urgency(&task, &cfg, &inputs());
            assert!((value - expected).abs() < 1e-9, "priority {priority}: {value}");
        }
    }

    #[test]
    fn tags_and_annotations_scale_with_count() {
        let mut cfg = silent_config();
        cfg.set("urgency.tags.coefficient", "1.0");

        let mut task = bare_task();
        task.add_tag("one");
        assert!((urgency(&task, &cfg, &inputs()) - 0.8).abs() < 1e-9);

        task.add_tag("two");
        assert!((urgency(&task, &cfg, &inputs()) - 0.9).abs() < 1e-9);

        task.add_tag("three");
        task.add_tag("four");
        assert!((urgency(&task, &cfg, &inputs()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn due_ramp() {
        let mut cfg = silent_config();
        cfg.set("urgency.due.coefficient", "1.0");
        let now = fixed_now();

        // A week or more overdue saturates at 1.0.
        let mut task = bare_task();
        task.set_date("due", now - Duration::days(8));
        assert!((urgency(&task, &cfg, &inputs()) - 1.0).abs() < 1e-9);

        // More than two weeks out floors at 0.2.
        let mut task = bare_task();
        task.set_date("due", now + Duration::days(30));
        assert!((urgency(&task, &cfg, &inputs()) - 0.2).abs() < 1e-9);

        // Due right now sits on the ramp at (14 * 0.8 / 21) + 0.2.
        let mut task = bare_task();
        task.set_date("due", now);
        let expected = (14.0 * 0.8 / 21.0) + 0.2;
        assert!((urgency(&task, &cfg, &inputs()) - expected).abs() < 1e-6);
    }

    #[test]
    fn blocked_and_waiting_can_subtract() {
        let mut cfg = silent_config();
        cfg.set("urgency.blocked.coefficient", "-5.0");
        cfg.set("urgency.waiting.coefficient", "-3.0");

        let mut task = bare_task();
        task.set_status(Status::Waiting);
        let value = urgency(
            &task,
            &cfg,
            &UrgencyInputs {
                now: fixed_now(),
                is_blocked: true,
                is_blocking: false,
            },
        );
        assert!((value - (-8.0)).abs() < 1e-9);
    }

    #[test]
    fn user_coefficients_add_directly() {
        let mut cfg = silent_config();
        cfg.set("urgency.user.project.home.coefficient", "4.5");
        cfg.set("urgency.user.tag.next.coefficient", "0.0");
        cfg.set("urgency.uda.estimate.coefficient", "2.0");

        let mut task = bare_task();
        task.set("project", "home.finance");
        task.set("estimate", "3h");
        let value = urgency(&task, &cfg, &inputs());
        assert!((value - 6.5).abs() < 1e-9);
    }

    #[test]
    fn cache_invalidated_by_mutation() {
        let mut cfg = silent_config();
        cfg.set("urgency.project.coefficient", "1.0");

        let mut task = bare_task();
        let before = urgency(&task, &cfg, &inputs());
        assert_eq!(before, 0.0);
        assert_eq!(task.urgency_cached(), Some(0.0));

        task.set("project", "anything");
        assert_eq!(task.urgency_cached(), None);
        let after = urgency(&task, &cfg, &inputs());
        assert!((after - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_coefficient_terms_are_skipped() {
        let cfg = silent_config();
        let mut task = bare_task();
        task.set("priority", "H");
        task.add_tag("next");
        task.set_date("due", fixed_now());
        assert_eq!(urgency(&task, &cfg, &inputs()), 0.0);
    }
}
