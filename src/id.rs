//! ID generation utilities for promptq
//!
//! Task ids are short and filename-friendly; session ids are full UUIDs
//! because the external tool requires them.

use uuid::Uuid;

/// Prefix of placeholder session ids issued before the real session exists.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// Generate a task ID
///
/// Format: 8 lowercase hex characters, e.g. `3f9a0c1e`
pub fn generate_task_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Generate a placeholder session id for a chat that has not started yet
///
/// Format: `temp-{chat_name}-{8 hex}`
pub fn generate_placeholder_session_id(chat_name: &str) -> String {
    format!("{}{}-{}", PLACEHOLDER_PREFIX, chat_name, generate_task_id())
}

/// Generate a real session id to hand to the external tool
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// True if the session id is a placeholder awaiting rewrite
pub fn is_placeholder_session(session_id: &str) -> bool {
    session_id.starts_with(PLACEHOLDER_PREFIX)
}

/// Extract the chat name from a placeholder session id
///
/// `temp-backend-1a2b3c4d` -> `backend`. Chat names may contain hyphens, so
/// only the trailing random segment is stripped.
pub fn chat_name_from_placeholder(session_id: &str) -> Option<&str> {
    let rest = session_id.strip_prefix(PLACEHOLDER_PREFIX)?;
    let (name, _suffix) = rest.rsplit_once('-')?;
    if name.is_empty() { None } else { Some(name) }
}
