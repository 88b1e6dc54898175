use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use flychat_types::models::{FriendRequest, FriendRequestStatus, Friendship, Message, NewMessage, User};

use crate::Database;
use crate::store::Store;

const USER_COLUMNS: &str = "id, username, password_hash, avatar, created_at";
const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, is_group, is_read, created_at";
const REQUEST_COLUMNS: &str = "id, from_id, to_id, status, created_at";

impl Store for Database {
    // -- Users --

    fn insert_user(&self, user: &User) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO users (id, username, password_hash, avatar, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id.to_string(),
                    user.username,
                    user.password_hash,
                    user.avatar,
                    encode_time(user.created_at)
                ],
            )?;
            Ok(changed == 1)
        })
    }

    fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    [id.to_string()],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
    }

    fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                    [username],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
    }

    fn search_users(&self, keyword: &str, exclude: Uuid, limit: u32) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            // instr() instead of LIKE so '%' and '_' in the keyword match literally
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE id != ?1 AND instr(lower(username), lower(?2)) > 0
                 ORDER BY username
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![exclude.to_string(), keyword, limit], user_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn update_avatar(&self, id: Uuid, avatar: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET avatar = ?2 WHERE id = ?1",
                params![id.to_string(), avatar],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Messages --

    fn insert_message(&self, message: NewMessage) -> Result<Message> {
        self.with_conn(|conn| {
            let is_group = message.is_group();
            conn.execute(
                "INSERT INTO messages (sender_id, receiver_id, content, is_group, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    message.sender_id.to_string(),
                    message.receiver_id.map(|id| id.to_string()),
                    message.content,
                    is_group,
                    encode_time(message.created_at)
                ],
            )?;
            Ok(Message {
                id: conn.last_insert_rowid(),
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
                content: message.content,
                is_group,
                is_read: false,
                created_at: message.created_at,
            })
        })
    }

    fn group_messages(&self, offset: u64, limit: u32) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE is_group = 1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![limit, offset as i64], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn private_messages(&self, a: Uuid, b: Uuid, offset: u64, limit: u32) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE is_group = 0
                   AND ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(
                    params![a.to_string(), b.to_string(), limit, offset as i64],
                    message_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn mark_read(&self, ids: &[i64], receiver: Uuid) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (2..ids.len() + 2).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "UPDATE messages SET is_read = 1
                 WHERE receiver_id = ?1 AND is_read = 0 AND id IN ({})",
                placeholders.join(", ")
            );

            let receiver = receiver.to_string();
            let mut params: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 1);
            params.push(&receiver);
            params.extend(ids.iter().map(|id| id as &dyn ToSql));

            let changed = conn.execute(&sql, params.as_slice())?;
            Ok(changed)
        })
    }

    fn unread_counts(&self, receiver: Uuid) -> Result<Vec<(Uuid, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sender_id, COUNT(*) FROM messages
                 WHERE receiver_id = ?1 AND is_read = 0
                 GROUP BY sender_id",
            )?;
            let rows = stmt
                .query_map([receiver.to_string()], |row| {
                    Ok((uuid_at(row, 0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // -- Friend requests --

    fn insert_friend_request(
        &self,
        from: Uuid,
        to: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Option<FriendRequest>> {
        self.with_conn(|conn| {
            // The partial unique index turns a second pending request into a no-op
            let changed = conn.execute(
                "INSERT OR IGNORE INTO friend_requests (from_id, to_id, status, created_at)
                 VALUES (?1, ?2, 'pending', ?3)",
                params![from.to_string(), to.to_string(), encode_time(created_at)],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(Some(FriendRequest {
                id: conn.last_insert_rowid(),
                from_id: from,
                to_id: to,
                status: FriendRequestStatus::Pending,
                created_at,
            }))
        })
    }

    fn friend_request(&self, id: i64) -> Result<Option<FriendRequest>> {
        self.with_conn(|conn| {
            let request = conn
                .query_row(
                    &format!("SELECT {REQUEST_COLUMNS} FROM friend_requests WHERE id = ?1"),
                    [id],
                    request_from_row,
                )
                .optional()?;
            Ok(request)
        })
    }

    fn pending_request_between(&self, from: Uuid, to: Uuid) -> Result<Option<FriendRequest>> {
        self.with_conn(|conn| {
            let request = conn
                .query_row(
                    &format!(
                        "SELECT {REQUEST_COLUMNS} FROM friend_requests
                         WHERE from_id = ?1 AND to_id = ?2 AND status = 'pending'"
                    ),
                    [from.to_string(), to.to_string()],
                    request_from_row,
                )
                .optional()?;
            Ok(request)
        })
    }

    fn pending_requests_for(&self, to: Uuid) -> Result<Vec<FriendRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM friend_requests
                 WHERE to_id = ?1 AND status = 'pending'
                 ORDER BY created_at, id"
            ))?;
            let rows = stmt
                .query_map([to.to_string()], request_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn resolve_friend_request(&self, id: i64, status: FriendRequestStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE friend_requests SET status = ?2 WHERE id = ?1 AND status = 'pending'",
                params![id, status.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    fn dangling_acceptances(&self) -> Result<Vec<FriendRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM friend_requests r
                 WHERE r.status = 'accepted'
                   AND NOT EXISTS (
                       SELECT 1 FROM friendships f
                       WHERE (f.user_a = r.from_id AND f.user_b = r.to_id)
                          OR (f.user_a = r.to_id AND f.user_b = r.from_id)
                   )
                 ORDER BY r.id"
            ))?;
            let rows = stmt
                .query_map([], request_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // -- Friendships --

    fn insert_friendship(&self, friendship: &Friendship) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO friendships (user_a, user_b, created_at) VALUES (?1, ?2, ?3)",
                params![
                    friendship.user_a.to_string(),
                    friendship.user_b.to_string(),
                    encode_time(friendship.created_at)
                ],
            )?;
            Ok(changed == 1)
        })
    }

    fn friendship_exists(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let (user_a, user_b) = if a <= b { (a, b) } else { (b, a) };
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM friendships WHERE user_a = ?1 AND user_b = ?2)",
                [user_a.to_string(), user_b.to_string()],
                |row| row.get::<_, bool>(0),
            )?;
            Ok(exists)
        })
    }

    fn friendships_of(&self, user: Uuid) -> Result<Vec<Friendship>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_a, user_b, created_at FROM friendships
                 WHERE user_a = ?1 OR user_b = ?1
                 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([user.to_string()], |row| {
                    Ok(Friendship {
                        user_a: uuid_at(row, 0)?,
                        user_b: uuid_at(row, 1)?,
                        created_at: time_at(row, 2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

/// Fixed-width RFC 3339 so that text ordering in SQLite matches time ordering.
fn encode_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, 0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        avatar: row.get(3)?,
        created_at: time_at(row, 4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let receiver_id = match row.get::<_, Option<String>>(2)? {
        Some(raw) => Some(raw.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        sender_id: uuid_at(row, 1)?,
        receiver_id,
        content: row.get(3)?,
        is_group: row.get(4)?,
        is_read: row.get(5)?,
        created_at: time_at(row, 6)?,
    })
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<FriendRequest> {
    let status: String = row.get(3)?;
    let status = status
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;

    Ok(FriendRequest {
        id: row.get(0)?,
        from_id: uuid_at(row, 1)?,
        to_id: uuid_at(row, 2)?,
        status,
        created_at: time_at(row, 4)?,
    })
}
