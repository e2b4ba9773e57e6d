use chrono::{DateTime, Local};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

use super::{ChatSession, SessionDirectory};
use crate::error::{QueueError, Result};

/// SQLite-backed session directory
///
/// Holds only the database path; each call opens its own connection so the
/// directory can be shared across threads.
#[derive(Debug, Clone)]
pub struct SqliteSessionDirectory {
    db_path: PathBuf,
}

impl SqliteSessionDirectory {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let directory = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        let conn = directory.connect()?;
        Self::init_schema(&conn)?;
        Ok(directory)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path).map_err(|e| {
            QueueError::Session(format!(
                "Failed to open session database {}: {}",
                self.db_path.display(),
                e
            ))
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_name TEXT UNIQUE NOT NULL,
                session_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL,
                total_prompts INTEGER NOT NULL DEFAULT 0,
                working_directory TEXT NOT NULL DEFAULT '.'
            );

            CREATE INDEX IF NOT EXISTS idx_chat_sessions_session ON chat_sessions(session_id);
            "#,
        )?;
        Ok(())
    }

    fn to_local(millis: i64) -> DateTime<Local> {
        DateTime::from_timestamp_millis(millis)
            .map(|at| at.with_timezone(&Local))
            .unwrap_or_default()
    }
}

impl SessionDirectory for SqliteSessionDirectory {
    fn resolve(&self, name: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let session_id = conn
            .query_row(
                "SELECT session_id FROM chat_sessions WHERE chat_name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(session_id)
    }

    fn record(&self, name: &str, session_id: &str, working_directory: &Path) -> Result<()> {
        let conn = self.connect()?;
        let now = Local::now().timestamp_millis();
        conn.execute(
            r#"
            INSERT INTO chat_sessions (chat_name, session_id, created_at, last_used, working_directory)
            VALUES (?1, ?2, ?3, ?3, ?4)
            ON CONFLICT(chat_name) DO UPDATE SET
                session_id = excluded.session_id,
                last_used = excluded.last_used,
                working_directory = excluded.working_directory
            "#,
            params![name, session_id, now, working_directory.to_string_lossy()],
        )?;
        log::info!("Recorded chat '{}' -> session {}", name, session_id);
        Ok(())
    }

    fn touch(&self, name: &str) -> Result<()> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE chat_sessions SET last_used = ?1, total_prompts = total_prompts + 1 WHERE chat_name = ?2",
            params![Local::now().timestamp_millis(), name],
        )?;
        if updated == 0 {
            log::warn!("touch: no chat named '{}'", name);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<ChatSession>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT chat_name, session_id, working_directory, created_at, last_used, total_prompts
            FROM chat_sessions
            ORDER BY last_used DESC, chat_name
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let working_directory: String = row.get(2)?;
            let total_prompts: i64 = row.get(5)?;
            Ok(ChatSession {
                chat_name: row.get(0)?,
                session_id: row.get(1)?,
                working_directory: PathBuf::from(working_directory),
                created_at: Self::to_local(row.get(3)?),
                last_used: Self::to_local(row.get(4)?),
                total_prompts: total_prompts.max(0) as u64,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteSessionDirectory) {
        let temp = TempDir::new().unwrap();
        let directory = SqliteSessionDirectory::open(temp.path().join("sessions.db")).unwrap();
        (temp, directory)
    }

    #[test]
    fn test_resolve_unknown_is_none() {
        let (_temp, directory) = setup();
        assert_eq!(directory.resolve("nope").unwrap(), None);
        assert!(!directory.exists("nope").unwrap());
    }

    #[test]
    fn test_record_and_resolve() {
        let (_temp, directory) = setup();
        directory.record("backend", "sess-1", Path::new("/srv/app")).unwrap();
        assert_eq!(directory.resolve("backend").unwrap().as_deref(), Some("sess-1"));
        assert!(directory.exists("backend").unwrap());
    }

    #[test]
    fn test_record_repoints_existing_name() {
        let (_temp, directory) = setup();
        directory.record("backend", "sess-1", Path::new(".")).unwrap();
        directory.touch("backend").unwrap();
        directory.record("backend", "sess-2", Path::new(".")).unwrap();

        let sessions = directory.list().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "sess-2");
        assert_eq!(sessions[0].total_prompts, 1);
    }

    #[test]
    fn test_touch_counts_prompts() {
        let (_temp, directory) = setup();
        directory.record("docs", "sess-9", Path::new("/tmp")).unwrap();
        directory.touch("docs").unwrap();
        directory.touch("docs").unwrap();
        directory.touch("missing").unwrap();

        let sessions = directory.list().unwrap();
        assert_eq!(sessions[0].total_prompts, 2);
        assert_eq!(sessions[0].working_directory, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sessions.db");
        SqliteSessionDirectory::open(&path)
            .unwrap()
            .record("a", "s", Path::new("."))
            .unwrap();
        let reopened = SqliteSessionDirectory::open(&path).unwrap();
        assert_eq!(reopened.resolve("a").unwrap().as_deref(), Some("s"));
    }
}
