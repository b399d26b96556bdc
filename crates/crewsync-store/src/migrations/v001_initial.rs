//! v001 -- session cache and credential slot.
//!
//! Both tables hold at most one row (`slot = 1`): a client process serves
//! exactly one signed-in session.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Last-known session
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS session_cache (
    slot         INTEGER PRIMARY KEY CHECK (slot = 1),
    user_id      TEXT NOT NULL,
    display_name TEXT NOT NULL,
    role         TEXT NOT NULL,               -- SCREAMING_SNAKE role tag
    company_id   TEXT NOT NULL,
    permissions  TEXT NOT NULL,               -- JSON array of capability tags
    refreshed_at TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Bearer credential
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS credentials (
    slot       INTEGER PRIMARY KEY CHECK (slot = 1),
    token      TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    company_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
