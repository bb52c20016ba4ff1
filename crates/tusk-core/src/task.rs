use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::Config;
use crate::dates;
use crate::duration::Duration;
use crate::error::{Error, Result, Warnings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Completed,
    Deleted,
    Recurring,
    Waiting,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Completed => "completed",
            Status::Deleted => "deleted",
            Status::Recurring => "recurring",
            Status::Waiting => "waiting",
        }
    }

    pub fn parse(text: &str) -> Option<Status> {
        match text {
            "pending" => Some(Status::Pending),
            "completed" => Some(Status::Completed),
            "deleted" => Some(Status::Deleted),
            "recurring" => Some(Status::Recurring),
            "waiting" => Some(Status::Waiting),
            _ => None,
        }
    }

    /// Statuses that live in the pending file.
    pub fn is_pending_file(&self) -> bool {
        matches!(self, Status::Pending | Status::Recurring | Status::Waiting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Text,
    Numeric,
    Date,
    DurationVal,
}

/// Built-in attribute names and their types. User-defined attributes extend
/// this set through `uda.<name>.type`.
pub const BUILTIN_ATTRIBUTES: &[(&str, AttrType)] = &[
    ("uuid", AttrType::Text),
    ("description", AttrType::Text),
    ("status", AttrType::Text),
    ("entry", AttrType::Date),
    ("start", AttrType::Date),
    ("end", AttrType::Date),
    ("due", AttrType::Date),
    ("wait", AttrType::Date),
    ("scheduled", AttrType::Date),
    ("until", AttrType::Date),
    ("modified", AttrType::Date),
    ("recur", AttrType::DurationVal),
    ("mask", AttrType::Text),
    ("imask", AttrType::Numeric),
    ("parent", AttrType::Text),
    ("project", AttrType::Text),
    ("priority", AttrType::Text),
    ("tags", AttrType::Text),
    ("depends", AttrType::Text),
];

/// The closed attribute namespace: built-ins plus configured UDAs. Names
/// outside the registry are carried as opaque strings so records round-trip
/// losslessly.
#[derive(Debug, Clone)]
pub struct AttributeRegistry {
    types: BTreeMap<String, AttrType>,
}

impl AttributeRegistry {
    pub fn from_config(cfg: &Config) -> Self {
        let mut types = BTreeMap::new();
        for (name, attr_type) in BUILTIN_ATTRIBUTES {
            types.insert((*name).to_string(), *attr_type);
        }

        for key in cfg.keys_with_prefix("uda.") {
            let Some(rest) = key.strip_prefix("uda.") else {
                continue;
            };
            let Some(name) = rest.strip_suffix(".type") else {
                continue;
            };
            let attr_type = match cfg.get(&key).as_deref() {
                Some("numeric") => AttrType::Numeric,
                Some("date") => AttrType::Date,
                Some("duration") => AttrType::DurationVal,
                _ => AttrType::Text,
            };
            types.insert(name.to_string(), attr_type);
        }

        Self { types }
    }

    pub fn attr_type(&self, name: &str) -> Option<AttrType> {
        if name.starts_with("annotation_") {
            return Some(AttrType::Text);
        }
        self.types.get(name).copied()
    }

    pub fn is_attribute(&self, name: &str) -> bool {
        self.attr_type(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

/// A task: an ordered mapping from attribute name to raw string value.
/// Dates are epoch seconds on the inside; the JSON seam renders them as
/// ISO-8601 wire strings.
#[derive(Debug, Clone, Default)]
pub struct Task {
    data: BTreeMap<String, String>,
    /// Display id, assigned at load time; 0 means "no id".
    pub id: u64,
    urgency_cache: Cell<Option<f64>>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.data.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.data.get(name).map(|v| !v.is_empty()).unwrap_or(false)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.data.remove(name);
        } else {
            self.data.insert(name.to_string(), value);
        }
        self.urgency_cache.set(None);
    }

    pub fn remove(&mut self, name: &str) {
        self.data.remove(name);
        self.urgency_cache.set(None);
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn uuid(&self) -> &str {
        self.get("uuid").unwrap_or("")
    }

    pub fn description(&self) -> &str {
        self.get("description").unwrap_or("")
    }

    pub fn status(&self) -> Status {
        self.get("status")
            .and_then(Status::parse)
            .unwrap_or(Status::Pending)
    }

    pub fn set_status(&mut self, status: Status) {
        self.set("status", status.as_str());
    }

    pub fn get_date(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.get(name)?;
        let epoch: i64 = raw.parse().ok()?;
        DateTime::<Utc>::from_timestamp(epoch, 0)
    }

    pub fn set_date(&mut self, name: &str, when: DateTime<Utc>) {
        self.set(name, when.timestamp().to_string());
    }

    pub fn get_duration(&self, name: &str) -> Option<Duration> {
        self.get(name)?.parse().ok()
    }

    // Tags are a comma-joined set.

    pub fn tags(&self) -> Vec<String> {
        self.get("tags")
            .map(|t| t.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().iter().any(|t| t == tag)
    }

    pub fn add_tag(&mut self, tag: &str) {
        let mut tags = self.tags();
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
        self.set("tags", tags.join(","));
    }

    pub fn remove_tag(&mut self, tag: &str) {
        let tags: Vec<String> = self.tags().into_iter().filter(|t| t != tag).collect();
        self.set("tags", tags.join(","));
    }

    // Dependencies are a comma-joined set of uuids.

    pub fn depends(&self) -> Vec<String> {
        self.get("depends")
            .map(|t| t.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn add_depend(&mut self, uuid: &str) {
        let mut deps = self.depends();
        if !deps.iter().any(|d| d == uuid) {
            deps.push(uuid.to_string());
        }
        self.set("depends", deps.join(","));
    }

    pub fn remove_depend(&mut self, uuid: &str) {
        let deps: Vec<String> = self.depends().into_iter().filter(|d| d != uuid).collect();
        self.set("depends", deps.join(","));
    }

    // Annotations are attributes named `annotation_<epoch>`.

    pub fn annotations(&self) -> Vec<(i64, String)> {
        let mut out: Vec<(i64, String)> = self
            .data
            .iter()
            .filter_map(|(k, v)| {
                let epoch = k.strip_prefix("annotation_")?.parse().ok()?;
                Some((epoch, v.clone()))
            })
            .collect();
        out.sort_by_key(|(epoch, _)| *epoch);
        out
    }

    pub fn annotation_count(&self) -> usize {
        self.data
            .keys()
            .filter(|k| k.starts_with("annotation_"))
            .count()
    }

    pub fn add_annotation(&mut self, now: DateTime<Utc>, text: &str) {
        // Timestamps key annotations; bump until unique so two annotations
        // in one second both survive.
        let mut epoch = now.timestamp();
        while self.data.contains_key(&format!("annotation_{epoch}")) {
            epoch += 1;
        }
        self.set(&format!("annotation_{epoch}"), text);
    }

    pub fn remove_annotations_matching(&mut self, needle: &str) -> usize {
        let keys: Vec<String> = self
            .data
            .iter()
            .filter(|(k, v)| k.starts_with("annotation_") && v.contains(needle))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub fn urgency_cached(&self) -> Option<f64> {
        self.urgency_cache.get()
    }

    pub fn cache_urgency(&self, value: f64) {
        self.urgency_cache.set(Some(value));
    }

    // ------------------------------------------------------------------
    // FF4 on-disk form: `[ name:"value" ... ]`, values JSON-escaped with
    // the bracket characters entity-encoded so the outer delimiters stay
    // unambiguous.

    pub fn compose_ff4(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push('[');
        let mut first = true;
        for (name, value) in &self.data {
            if value.is_empty() {
                continue;
            }
            if !first {
                out.push(' ');
            }
            let _ = write!(out, "{}:\"{}\"", name, encode_value(value));
            first = false;
        }
        out.push(']');
        out
    }

    pub fn parse_ff4(line: &str) -> Result<Task> {
        let trimmed = line.trim_end_matches('\n').trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| Error::Parse(format!("not a task record: {trimmed}")))?;

        if inner.trim().is_empty() {
            return Err(Error::Parse("empty task record".to_string()));
        }

        let mut task = Task::new();
        let bytes = inner.as_bytes();
        let mut pos = 0;
        while pos < bytes.len() {
            while pos < bytes.len() && bytes[pos] == b' ' {
                pos += 1;
            }
            if pos >= bytes.len() {
                break;
            }

            let name_start = pos;
            while pos < bytes.len() && bytes[pos] != b':' {
                pos += 1;
            }
            if pos >= bytes.len() {
                return Err(Error::Parse(format!("malformed task record: {trimmed}")));
            }
            let name = &inner[name_start..pos];
            pos += 1;

            if bytes.get(pos) != Some(&b'"') {
                return Err(Error::Parse(format!("malformed task record: {trimmed}")));
            }
            pos += 1;
            let value_start = pos;
            while pos < bytes.len() {
                if bytes[pos] == b'\\' {
                    pos += 2;
                    continue;
                }
                if bytes[pos] == b'"' {
                    break;
                }
                pos += 1;
            }
            if pos >= bytes.len() {
                return Err(Error::Parse(format!("unterminated value in: {trimmed}")));
            }
            let value = &inner[value_start..pos];
            pos += 1;

            task.data
                .insert(name.to_string(), decode_value(value)?);
        }

        if task.data.is_empty() {
            return Err(Error::Parse("empty task record".to_string()));
        }
        Ok(task)
    }

    // ------------------------------------------------------------------
    // JSON form, used by the backlog, export/import and hooks. Dates are
    // ISO wire strings, tags an array, annotations an array of objects.

    pub fn compose_json(&self, registry: &AttributeRegistry, decorate: bool) -> Value {
        let mut obj = Map::new();

        if decorate && self.id > 0 {
            obj.insert("id".to_string(), Value::from(self.id));
        }

        let mut annotations: Vec<Value> = Vec::new();
        for (name, value) in &self.data {
            if let Some(epoch) = name.strip_prefix("annotation_") {
                let entry = epoch
                    .parse::<i64>()
                    .ok()
                    .and_then(|e| DateTime::<Utc>::from_timestamp(e, 0))
                    .map(dates::render_wire)
                    .unwrap_or_else(|| epoch.to_string());
                let mut ann = Map::new();
                ann.insert("entry".to_string(), Value::from(entry));
                ann.insert("description".to_string(), Value::from(value.clone()));
                annotations.push(Value::Object(ann));
                continue;
            }

            if name == "tags" {
                let tags: Vec<Value> = self.tags().into_iter().map(Value::from).collect();
                obj.insert("tags".to_string(), Value::Array(tags));
                continue;
            }

            if name == "depends" {
                let deps: Vec<Value> = self.depends().into_iter().map(Value::from).collect();
                obj.insert("depends".to_string(), Value::Array(deps));
                continue;
            }

            match registry.attr_type(name) {
                Some(AttrType::Date) => {
                    let rendered = self
                        .get_date(name)
                        .map(dates::render_wire)
                        .unwrap_or_else(|| value.clone());
                    obj.insert(name.clone(), Value::from(rendered));
                }
                Some(AttrType::Numeric) => {
                    if let Ok(n) = value.parse::<i64>() {
                        obj.insert(name.clone(), Value::from(n));
                    } else if let Ok(f) = value.parse::<f64>() {
                        obj.insert(name.clone(), Value::from(f));
                    } else {
                        obj.insert(name.clone(), Value::from(value.clone()));
                    }
                }
                _ => {
                    obj.insert(name.clone(), Value::from(value.clone()));
                }
            }
        }

        if !annotations.is_empty() {
            obj.insert("annotations".to_string(), Value::Array(annotations));
        }

        Value::Object(obj)
    }

    pub fn parse_json(value: &Value, registry: &AttributeRegistry) -> Result<Task> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Parse("task JSON must be an object".to_string()))?;

        let mut task = Task::new();
        for (name, field) in obj {
            match name.as_str() {
                "id" | "urgency" => continue,
                "tags" => {
                    let tags: Vec<String> = match field {
                        Value::Array(items) => items
                            .iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect(),
                        Value::String(s) => {
                            s.split(',').filter(|s| !s.is_empty()).map(String::from).collect()
                        }
                        _ => vec![],
                    };
                    if !tags.is_empty() {
                        task.data.insert("tags".to_string(), tags.join(","));
                    }
                }
                "depends" => {
                    let deps: Vec<String> = match field {
                        Value::Array(items) => items
                            .iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect(),
                        Value::String(s) => {
                            s.split(',').filter(|s| !s.is_empty()).map(String::from).collect()
                        }
                        _ => vec![],
                    };
                    if !deps.is_empty() {
                        task.data.insert("depends".to_string(), deps.join(","));
                    }
                }
                "annotations" => {
                    let Some(items) = field.as_array() else {
                        continue;
                    };
                    for item in items {
                        let entry = item
                            .get("entry")
                            .and_then(Value::as_str)
                            .and_then(dates::parse_wire)
                            .map(|dt| dt.timestamp())
                            .unwrap_or(0);
                        let description = item
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let mut epoch = entry;
                        while task.data.contains_key(&format!("annotation_{epoch}")) {
                            epoch += 1;
                        }
                        task.data
                            .insert(format!("annotation_{epoch}"), description.to_string());
                    }
                }
                _ => {
                    let raw = match field {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => other.to_string(),
                    };
                    let stored = match registry.attr_type(name) {
                        Some(AttrType::Date) => dates::parse_wire(&raw)
                            .map(|dt| dt.timestamp().to_string())
                            .unwrap_or(raw),
                        // Unknown names are preserved verbatim: UDA orphans.
                        _ => raw,
                    };
                    if !stored.is_empty() {
                        task.data.insert(name.clone(), stored);
                    }
                }
            }
        }

        Ok(task)
    }

    // ------------------------------------------------------------------
    // Validation and defaults.

    /// Fill in what `add` leaves implicit. Does not overwrite anything the
    /// user supplied.
    pub fn apply_defaults(&mut self, cfg: &Config, registry: &AttributeRegistry, now: DateTime<Utc>) {
        if !self.has("uuid") {
            self.set("uuid", Uuid::new_v4().to_string());
        }
        if !self.has("entry") {
            self.set_date("entry", now);
        }
        if !self.has("status") {
            self.set_status(Status::Pending);
        }

        if !self.has("project")
            && let Some(project) = cfg.get("default.project")
            && !project.is_empty()
        {
            self.set("project", project);
        }
        if !self.has("priority")
            && let Some(priority) = cfg.get("default.priority")
            && !priority.is_empty()
        {
            self.set("priority", priority);
        }
        if !self.has("due")
            && let Some(due) = cfg.get("default.due")
            && !due.is_empty()
            && let Some(dt) = dates::parse_date(&due, now, &crate::dates::DateSettings::default())
        {
            self.set_date("due", dt);
        }

        for key in cfg.keys_with_prefix("uda.") {
            let Some(rest) = key.strip_prefix("uda.") else {
                continue;
            };
            let Some(name) = rest.strip_suffix(".default") else {
                continue;
            };
            if registry.is_attribute(name) && !self.has(name)
                && let Some(default) = cfg.get(&key)
            {
                self.set(name, default);
            }
        }
    }

    /// The §4.9 checks. Hard failures return Validation errors; date-order
    /// anomalies only warn.
    pub fn validate(&self, warnings: &mut Warnings) -> Result<()> {
        if self.description().trim().is_empty() {
            return Err(Error::Validation(
                "a task must have a description".to_string(),
            ));
        }

        if let Some(raw) = self.get("status")
            && Status::parse(raw).is_none()
        {
            return Err(Error::Validation(format!("unknown status: {raw}")));
        }

        if self.has("recur") {
            if !self.has("due") && self.status() == Status::Recurring {
                return Err(Error::Validation(
                    "a recurring task must have a due date".to_string(),
                ));
            }
            if self.get_duration("recur").is_none() {
                return Err(Error::Validation(format!(
                    "not a valid recurrence period: {}",
                    self.get("recur").unwrap_or_default()
                )));
            }
        }

        match self.get("priority") {
            None | Some("H") | Some("M") | Some("L") | Some("") => {}
            Some(other) => {
                return Err(Error::Validation(format!(
                    "priority must be H, M or L, not {other}"
                )));
            }
        }

        let ordered: &[(&str, &str)] = &[
            ("wait", "due"),
            ("entry", "start"),
            ("entry", "end"),
            ("wait", "scheduled"),
            ("scheduled", "start"),
            ("scheduled", "due"),
            ("scheduled", "end"),
        ];
        for (earlier, later) in ordered {
            if let (Some(a), Some(b)) = (self.get_date(earlier), self.get_date(later))
                && a > b
            {
                warnings.push(format!(
                    "'{earlier}' is later than '{later}' on task {}",
                    self.uuid()
                ));
            }
        }

        if let Some(deps) = self.get("depends")
            && deps.split(',').any(|d| d == self.uuid())
        {
            return Err(Error::Validation(format!(
                "task {} cannot depend on itself",
                self.uuid()
            )));
        }

        Ok(())
    }
}

/// Escape a value for FF4: JSON string escaping, then the record delimiters.
fn encode_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '[' => out.push_str("&open;"),
            ']' => out.push_str("&close;"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

fn decode_value(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('/') => out.push('/'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .map_err(|_| Error::Parse(format!("bad escape \\u{hex}")))?;
                out.push(
                    char::from_u32(code)
                        .ok_or_else(|| Error::Parse(format!("bad escape \\u{hex}")))?,
                );
            }
            other => {
                return Err(Error::Parse(format!("bad escape \\{}", other.unwrap_or(' '))));
            }
        }
    }
    Ok(out.replace("&open;", "[").replace("&close;", "]"))
}
