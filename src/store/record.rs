//! Task record codec.
//!
//! One task is one self-describing markdown file:
//!
//! ```text
//! ---
//! id: 3f9a0c1e
//! priority: 0
//! working_directory: /home/me/project
//! max_retries: 3
//! retry_count: 1
//! status: queued
//! created_at: 2026-10-19T09:12:44.120+02:00
//! ---
//!
//! Refactor the auth module ...
//!
//! ## Execution Log
//!
//! ```
//! [2026-10-19 09:13:02] Started execution (attempt 1/4)
//! ```
//! ```
//!
//! Hand-written files without a header are accepted and load with defaults.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::{DEFAULT_MAX_RETRIES, Task, TaskStatus};
use crate::error::Result;

const FRONT_MATTER_FENCE: &str = "---\n";
const LOG_HEADING: &str = "## Execution Log";
const LOG_MARKER: &str = "\n\n## Execution Log\n\n```\n";
const LOG_CLOSE: &str = "```\n";
const SLUG_MAX_CHARS: usize = 50;

/// Key-value header of a record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RecordHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    priority: i64,
    working_directory: Option<PathBuf>,
    max_retries: Option<u32>,
    retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    context_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_session_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_executed: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limited_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_time: Option<DateTime<Local>>,
}

/// Serialize a task into its on-disk record
pub fn render(task: &Task) -> Result<String> {
    let header = RecordHeader {
        id: Some(task.id.clone()),
        priority: task.priority,
        working_directory: Some(task.working_directory.clone()),
        max_retries: Some(task.max_retries),
        retry_count: task.retry_count,
        status: Some(task.status),
        created_at: Some(task.created_at),
        context_files: task.context_files.clone(),
        estimated_tokens: task.estimated_tokens,
        session_id: task.session_id.clone(),
        is_session_start: task.is_session_start,
        chat_name: task.chat_name.clone(),
        last_executed: task.last_executed,
        rate_limited_at: task.rate_limited_at,
        reset_time: task.reset_time,
    };

    let mut out = String::from(FRONT_MATTER_FENCE);
    out.push_str(&serde_yaml::to_string(&header)?);
    out.push_str(FRONT_MATTER_FENCE);
    out.push('\n');
    out.push_str(&escape_content(&task.content));

    if !task.execution_log.is_empty() {
        out.push_str(LOG_MARKER);
        out.push_str(&task.execution_log);
        if !task.execution_log.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(LOG_CLOSE);
    }
    Ok(out)
}

/// Split a record into (header text, body)
fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text.strip_prefix(FRONT_MATTER_FENCE) else {
        return (None, text);
    };
    if let Some(body) = rest.strip_prefix(FRONT_MATTER_FENCE) {
        return (Some(""), body);
    }
    match rest.find("\n---\n") {
        Some(idx) => (Some(&rest[..idx + 1]), &rest[idx + 5..]),
        None => (None, text),
    }
}

/// Prefix content lines that look like the log heading with one more `\\`
///
/// Keeps the first log marker in a body unambiguous; `unescape_content`
/// strips exactly one backslash again.
fn escape_content(content: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            if line.trim_start_matches('\\') == LOG_HEADING {
                format!("\\{}", line)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape_content(content: &str) -> String {
    content
        .split('\n')
        .map(|line| match line.strip_prefix('\\') {
            Some(rest) if rest.trim_start_matches('\\') == LOG_HEADING => rest,
            _ => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a body into (content, execution log)
fn split_log(body: &str) -> (&str, &str) {
    match body.find(LOG_MARKER) {
        Some(idx) => {
            let log = &body[idx + LOG_MARKER.len()..];
            let log = log
                .strip_suffix(LOG_CLOSE)
                .or_else(|| log.strip_suffix("```"))
                .unwrap_or(log);
            (&body[..idx], log)
        }
        None => (body, ""),
    }
}

/// Parse a record. `fallback_id` comes from the filename and is used when the
/// header carries no id; `fallback_created` is used when it carries no
/// creation time.
pub fn parse(text: &str, fallback_id: &str, fallback_created: DateTime<Local>) -> Task {
    let (header_text, body) = split_front_matter(text);
    let header = match header_text {
        Some(h) if !h.trim().is_empty() => match serde_yaml::from_str::<RecordHeader>(h) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("Ignoring unreadable header in record {}: {}", fallback_id, e);
                RecordHeader::default()
            }
        },
        _ => RecordHeader::default(),
    };
    let (content, execution_log) = split_log(body);

    Task {
        id: header.id.unwrap_or_else(|| fallback_id.to_string()),
        content: unescape_content(content.trim()),
        working_directory: header.working_directory.unwrap_or_else(|| PathBuf::from(".")),
        priority: header.priority,
        context_files: header.context_files,
        max_retries: header.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        retry_count: header.retry_count,
        estimated_tokens: header.estimated_tokens,
        session_id: header.session_id,
        is_session_start: header.is_session_start,
        chat_name: header.chat_name,
        status: header.status.unwrap_or(TaskStatus::Queued),
        execution_log: execution_log.to_string(),
        created_at: header.created_at.unwrap_or(fallback_created),
        last_executed: header.last_executed,
        rate_limited_at: header.rate_limited_at,
        reset_time: header.reset_time,
    }
}

/// Make text safe for use in a filename
///
/// Anything outside `[A-Za-z0-9_]` becomes a hyphen; runs collapse and the
/// result is capped at 50 characters.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars().take(SLUG_MAX_CHARS) {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Filename without status suffix: `{id}-{slug}`
pub fn base_name(task: &Task) -> String {
    let slug = slugify(&task.content);
    if slug.is_empty() {
        task.id.clone()
    } else {
        format!("{}-{}", task.id, slug)
    }
}

/// Task id encoded in a record filename
pub fn id_from_file_name(file_name: &str) -> &str {
    let stem = file_name.strip_suffix(".md").unwrap_or(file_name);
    let end = stem.find(['-', '.']).unwrap_or(stem.len());
    &stem[..end]
}
