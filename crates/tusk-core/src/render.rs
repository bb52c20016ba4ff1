use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, Local, Utc};
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::dates;
use crate::error::{Error, Result};
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
    dateformat: String,
}

impl Renderer {
    pub fn new(cfg: &Config) -> Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(Error::Validation(format!("invalid color setting: {other}"))),
        };
        let dateformat = cfg
            .get("dateformat.report")
            .or_else(|| cfg.get("dateformat"))
            .unwrap_or_else(|| "Y-M-D".to_string());

        Ok(Self { color, dateformat })
    }

    #[tracing::instrument(skip(self, tasks, now))]
    pub fn print_task_table(&mut self, tasks: &[Task], now: DateTime<Utc>) -> Result<()> {
        let mut out = io::stdout().lock();

        let headers = vec![
            "ID".to_string(),
            "Project".to_string(),
            "Pri".to_string(),
            "Due".to_string(),
            "Tags".to_string(),
            "Description".to_string(),
            "Urg".to_string(),
        ];

        let mut rows = Vec::with_capacity(tasks.len());
        for task in tasks {
            let id = if task.id > 0 {
                task.id.to_string()
            } else {
                short_uuid(task.uuid())
            };
            let id = self.paint(&id, "33");

            let due_rendered = task
                .get_date("due")
                .map(|due| dates::render_template(due, &self.dateformat))
                .unwrap_or_default();
            let due = match task.get_date("due") {
                Some(due) if due < now => self.paint(&due_rendered, "31"),
                _ => due_rendered,
            };

            let tags = task
                .tags()
                .iter()
                .map(|tag| format!("+{tag}"))
                .collect::<Vec<_>>()
                .join(" ");

            let urgency = task
                .urgency_cached()
                .map(|u| format!("{u:.2}"))
                .unwrap_or_default();

            rows.push(vec![
                id,
                task.get("project").unwrap_or("").to_string(),
                task.get("priority").unwrap_or("").to_string(),
                due,
                tags,
                task.description().to_string(),
                urgency,
            ]);
        }

        write_table(&mut out, headers, rows)?;
        writeln!(out)?;
        writeln!(out, "{} task{}", tasks.len(), if tasks.len() == 1 { "" } else { "s" })?;
        Ok(())
    }

    #[tracing::instrument(skip(self, task))]
    pub fn print_task_detail(&mut self, task: &Task) -> Result<()> {
        let mut out = io::stdout().lock();

        writeln!(
            out,
            "id          {}",
            if task.id > 0 {
                task.id.to_string()
            } else {
                "-".to_string()
            }
        )?;

        for (name, value) in task.attributes() {
            if name.starts_with("annotation_") {
                continue;
            }
            let rendered = if task.get_date(name).is_some()
                && matches!(
                    name,
                    "entry" | "start" | "end" | "due" | "wait" | "scheduled" | "until" | "modified"
                ) {
                task.get_date(name)
                    .map(|dt| {
                        dt.with_timezone(&Local)
                            .format("%Y-%m-%d %H:%M:%S")
                            .to_string()
                    })
                    .unwrap_or_else(|| value.to_string())
            } else {
                value.to_string()
            };
            writeln!(out, "{name:<11} {rendered}")?;
        }

        for (entry, text) in task.annotations() {
            let stamp = DateTime::<Utc>::from_timestamp(entry, 0)
                .map(|dt| {
                    dt.with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string()
                })
                .unwrap_or_else(|| entry.to_string());
            writeln!(out, "annotation  {stamp} {text}")?;
        }

        if let Some(urgency) = task.urgency_cached() {
            writeln!(out, "urgency     {urgency:.4}")?;
        }

        Ok(())
    }

    /// Two-column diff of an undo transaction, for `undo` confirmation.
    pub fn print_transaction_diff(
        &mut self,
        old: Option<&Task>,
        new: &Task,
        when: i64,
    ) -> Result<()> {
        let mut out = io::stdout().lock();
        let stamp = DateTime::<Utc>::from_timestamp(when, 0)
            .map(|dt| {
                dt.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| when.to_string());
        writeln!(out, "The most recent modification was made {stamp}:")?;

        match old {
            None => {
                for (name, value) in new.attributes() {
                    writeln!(out, "  {} {name} {value}", self.paint("+", "32"))?;
                }
            }
            Some(old) => {
                for (name, value) in old.attributes() {
                    match new.get(name) {
                        Some(current) if current == value => {}
                        Some(current) => {
                            writeln!(out, "  {} {name} {value}", self.paint("-", "31"))?;
                            writeln!(out, "  {} {name} {current}", self.paint("+", "32"))?;
                        }
                        None => {
                            writeln!(out, "  {} {name} {value}", self.paint("-", "31"))?;
                        }
                    }
                }
                for (name, value) in new.attributes() {
                    if old.get(name).is_none() {
                        writeln!(out, "  {} {name} {value}", self.paint("+", "32"))?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn print_footnotes(&mut self, notes: &[String]) -> Result<()> {
        let mut out = io::stderr().lock();
        for note in notes {
            writeln!(out, "{}", self.paint(note, "33"))?;
        }
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn short_uuid(uuid: &str) -> String {
    uuid.chars().take(8).collect()
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for idx in 0..column_count {
        write!(writer, "{:-<width$} ", "", width = widths[idx])?;
    }
    writeln!(writer)?;

    for row in rows {
        for idx in 0..column_count {
            let cell = &row[idx];
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::strip_ansi;

    #[test]
    fn ansi_stripping() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("plain"), "plain");
    }
}
