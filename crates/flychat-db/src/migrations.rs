use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            password_hash   TEXT NOT NULL,
            avatar          TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            receiver_id     TEXT REFERENCES users(id),
            content         TEXT NOT NULL,
            is_group        INTEGER NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_group
            ON messages(is_group, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, receiver_id, created_at);

        CREATE TABLE IF NOT EXISTS friend_requests (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            from_id         TEXT NOT NULL REFERENCES users(id),
            to_id           TEXT NOT NULL REFERENCES users(id),
            status          TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
            created_at      TEXT NOT NULL
        );

        -- At most one open request per ordered pair
        CREATE UNIQUE INDEX IF NOT EXISTS idx_friend_requests_pending
            ON friend_requests(from_id, to_id) WHERE status = 'pending';

        CREATE INDEX IF NOT EXISTS idx_friend_requests_to
            ON friend_requests(to_id, status);

        CREATE TABLE IF NOT EXISTS friendships (
            user_a          TEXT NOT NULL REFERENCES users(id),
            user_b          TEXT NOT NULL REFERENCES users(id),
            created_at      TEXT NOT NULL,
            PRIMARY KEY (user_a, user_b),
            CHECK (user_a < user_b)
        );

        CREATE INDEX IF NOT EXISTS idx_friendships_b
            ON friendships(user_b);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
