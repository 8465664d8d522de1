use anyhow::Result;
use huddle_types::models::ProjectMember;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::Database;
use crate::models::{DeletedMessageRow, EditedMessageRow, MessageRow};

const MESSAGE_WITH_AUTHOR: &str =
    "SELECT m.id, m.channel_id, m.user_id, m.text, m.attachment_url, m.is_edited, m.created_at,
            u.username, u.avatar, u.color
     FROM messages m
     LEFT JOIN users u ON m.user_id = u.id";

impl Database {
    // -- Users / projects --

    pub fn create_user(&self, username: &str, avatar: Option<&str>, color: Option<&str>) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, avatar, color) VALUES (?1, ?2, ?3)",
                params![username, avatar, color],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn create_project(&self, name: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO projects (name) VALUES (?1)", [name])?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn add_project_member(&self, project_id: i64, user_id: i64, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3)",
                params![project_id, user_id, role],
            )?;
            Ok(())
        })
    }

    pub fn remove_project_member(&self, project_id: i64, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )?;
            Ok(())
        })
    }

    pub fn create_channel(&self, project_id: i64, name: &str, category: Option<&str>) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (project_id, name, category) VALUES (?1, ?2, ?3)",
                params![project_id, name, category],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Current membership of a project with display fields, ordered by username.
    pub fn project_members(&self, project_id: i64) -> Result<Vec<ProjectMember>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, pm.role, u.avatar, u.color
                 FROM project_members pm
                 JOIN users u ON pm.user_id = u.id
                 WHERE pm.project_id = ?1
                 ORDER BY u.username",
            )?;

            let rows = stmt
                .query_map([project_id], row_to_member)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Membership row of one user, `None` when they are not in the project.
    pub fn project_member(&self, project_id: i64, user_id: i64) -> Result<Option<ProjectMember>> {
        self.with_conn(|conn| {
            let member = conn
                .query_row(
                    "SELECT u.id, u.username, pm.role, u.avatar, u.color
                     FROM project_members pm
                     JOIN users u ON pm.user_id = u.id
                     WHERE pm.project_id = ?1 AND pm.user_id = ?2",
                    params![project_id, user_id],
                    row_to_member,
                )
                .optional()?;
            Ok(member)
        })
    }

    pub fn channel_project(&self, channel_id: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let project_id = conn
                .query_row(
                    "SELECT project_id FROM channels WHERE id = ?1",
                    [channel_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(project_id)
        })
    }

    /// Project of the channel a message lives in.
    pub fn message_project(&self, message_id: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let project_id = conn
                .query_row(
                    "SELECT c.project_id FROM messages m
                     JOIN channels c ON m.channel_id = c.id
                     WHERE m.id = ?1",
                    [message_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(project_id)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        channel_id: i64,
        user_id: i64,
        text: Option<&str>,
        attachment_url: Option<&str>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (channel_id, user_id, text, attachment_url) VALUES (?1, ?2, ?3, ?4)",
                params![channel_id, user_id, text, attachment_url],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_message_with_author(&self, message_id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("{} WHERE m.id = ?1", MESSAGE_WITH_AUTHOR);
            let row = conn.query_row(&sql, [message_id], row_to_message).optional()?;
            Ok(row)
        })
    }

    /// Page of a channel's history, newest first. `before` is a message id
    /// cursor: only strictly older messages are returned.
    pub fn get_messages(&self, channel_id: i64, limit: u32, before: Option<i64>) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE m.channel_id = ?1 AND m.id < ?2 ORDER BY m.id DESC LIMIT ?3",
                MESSAGE_WITH_AUTHOR
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![channel_id, before.unwrap_or(i64::MAX), limit],
                    row_to_message,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Author-only edit. Archives the previous text, then rewrites the row and
    /// flags it edited, all in one transaction.
    ///
    /// Returns `false` when no message with this id belongs to `user_id`.
    pub fn edit_message(&self, message_id: i64, user_id: i64, new_text: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let previous: Option<Option<String>> = tx
                .query_row(
                    "SELECT text FROM messages WHERE id = ?1 AND user_id = ?2",
                    params![message_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(previous_text) = previous else {
                return Ok(false);
            };

            tx.execute(
                "INSERT INTO edited_messages (message_id, user_id, previous_text) VALUES (?1, ?2, ?3)",
                params![message_id, user_id, previous_text],
            )?;
            tx.execute(
                "UPDATE messages SET text = ?1, is_edited = 1 WHERE id = ?2",
                params![new_text, message_id],
            )?;

            tx.commit()?;
            Ok(true)
        })
    }

    /// Author-only delete. The snapshot goes into `deleted_messages` before the
    /// live row is removed; if archiving fails nothing is deleted.
    ///
    /// Returns the archive record, or `None` when no message with this id
    /// belongs to `user_id`.
    pub fn delete_message(&self, message_id: i64, user_id: i64) -> Result<Option<DeletedMessageRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let live = tx
                .query_row(
                    "SELECT id, channel_id, user_id, text, attachment_url, is_edited, created_at
                     FROM messages WHERE id = ?1 AND user_id = ?2",
                    params![message_id, user_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, bool>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, channel_id, author_id, text, attachment_url, is_edited, created_at)) = live else {
                return Ok(None);
            };

            tx.execute(
                "INSERT INTO deleted_messages
                    (message_id, channel_id, user_id, text, attachment_url, is_edited, created_at, deleted_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![id, channel_id, author_id, text, attachment_url, is_edited, created_at, user_id],
            )?;
            let archive_id = tx.last_insert_rowid();

            let archived = query_deleted_by_id(&tx, archive_id)?;

            tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            tx.commit()?;

            Ok(Some(archived))
        })
    }

    // -- Audit trails --

    pub fn edit_history(&self, message_id: i64) -> Result<Vec<EditedMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, user_id, previous_text, edited_at
                 FROM edited_messages WHERE message_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([message_id], |row| {
                    Ok(EditedMessageRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        previous_text: row.get(3)?,
                        edited_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn deleted_archive(&self, message_id: i64) -> Result<Vec<DeletedMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, channel_id, user_id, text, attachment_url, is_edited,
                        created_at, deleted_by, deleted_at
                 FROM deleted_messages WHERE message_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([message_id], row_to_deleted)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        user_id: row.get(2)?,
        text: row.get(3)?,
        attachment_url: row.get(4)?,
        is_edited: row.get(5)?,
        created_at: row.get(6)?,
        username: row.get(7)?,
        avatar: row.get(8)?,
        color: row.get(9)?,
    })
}

fn row_to_deleted(row: &Row<'_>) -> rusqlite::Result<DeletedMessageRow> {
    Ok(DeletedMessageRow {
        id: row.get(0)?,
        message_id: row.get(1)?,
        channel_id: row.get(2)?,
        user_id: row.get(3)?,
        text: row.get(4)?,
        attachment_url: row.get(5)?,
        is_edited: row.get(6)?,
        created_at: row.get(7)?,
        deleted_by: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

fn row_to_member(row: &Row<'_>) -> rusqlite::Result<ProjectMember> {
    Ok(ProjectMember {
        id: row.get(0)?,
        username: row.get(1)?,
        role: row.get(2)?,
        avatar: row.get(3)?,
        color: row.get(4)?,
    })
}

fn query_deleted_by_id(conn: &Connection, archive_id: i64) -> Result<DeletedMessageRow> {
    let row = conn.query_row(
        "SELECT id, message_id, channel_id, user_id, text, attachment_url, is_edited,
                created_at, deleted_by, deleted_at
         FROM deleted_messages WHERE id = ?1",
        [archive_id],
        row_to_deleted,
    )?;
    Ok(row)
}
