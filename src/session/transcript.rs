use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

const ENTRY_HEADING: &str = "## Prompt - ";

/// Front matter of a transcript file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranscriptHeader {
    session_id: String,
    chat_name: String,
    created_at: DateTime<Local>,
    working_directory: PathBuf,
    total_prompts: usize,
}

/// One completed exchange in a session
#[derive(Debug, Clone)]
pub struct TranscriptEntry<'a> {
    pub session_id: &'a str,
    pub chat_name: Option<&'a str>,
    pub working_directory: &'a Path,
    pub executed_at: DateTime<Local>,
    pub prompt: &'a str,
    pub response: &'a str,
}

/// Append an exchange to `chats_dir/<session_id>.md`.
///
/// Creates the file with a header on first use, skips an entry that is
/// already present, and keeps `total_prompts` in the header current.
pub fn append_transcript(chats_dir: &Path, entry: &TranscriptEntry<'_>) -> Result<PathBuf> {
    let path = chats_dir.join(format!("{}.md", entry.session_id));
    let heading = format!("{}{}", ENTRY_HEADING, entry.executed_at.format("%Y-%m-%d %H:%M:%S"));
    let user_line = format!("**User:** {}", entry.prompt);

    let (mut header, mut body) = match fs::read_to_string(&path) {
        Ok(text) => match split_header(&text) {
            Some(parts) => parts,
            None => (new_header(entry), text),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let title = entry.chat_name.unwrap_or(entry.session_id);
            (new_header(entry), format!("\n# Chat: {}\n", title))
        }
        Err(e) => return Err(e.into()),
    };

    if body.contains(&heading) && body.contains(&user_line) {
        log::debug!("Transcript entry already present in {}", path.display());
        return Ok(path);
    }

    body.push_str(&format!("\n{}\n{}\n\n", heading, user_line));
    if !entry.response.trim().is_empty() {
        body.push_str(&format!("**Response:**\n{}\n", entry.response.trim_end()));
    }
    body.push_str("\n---\n");
    header.total_prompts = body.matches(ENTRY_HEADING).count();

    let text = format!("---\n{}---\n{}", serde_yaml::to_string(&header)?, body);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

fn new_header(entry: &TranscriptEntry<'_>) -> TranscriptHeader {
    TranscriptHeader {
        session_id: entry.session_id.to_string(),
        chat_name: entry.chat_name.unwrap_or("unnamed").to_string(),
        created_at: Local::now(),
        working_directory: entry.working_directory.to_path_buf(),
        total_prompts: 0,
    }
}

fn split_header(text: &str) -> Option<(TranscriptHeader, String)> {
    let rest = text.strip_prefix("---\n")?;
    let idx = rest.find("\n---\n")?;
    let header = serde_yaml::from_str(&rest[..idx + 1]).ok()?;
    Some((header, rest[idx + 5..].to_string()))
}
