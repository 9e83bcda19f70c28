use rusqlite::Connection;

use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    seq                    INTEGER PRIMARY KEY,
    id                     TEXT NOT NULL UNIQUE,
    kind                   TEXT NOT NULL CHECK(kind IN ('task', 'issue')),
    title                  TEXT NOT NULL,
    objective              TEXT NOT NULL DEFAULT '',
    acceptance             TEXT NOT NULL DEFAULT '[]',
    status                 TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'in_progress', 'completed', 'failed', 'halted')),
    category               TEXT NOT NULL CHECK(length(category) > 0),
    complexity             TEXT NOT NULL CHECK(complexity IN ('easy', 'normal', 'complex')),
    priority               TEXT NOT NULL CHECK(priority IN ('critical', 'high', 'medium', 'low')),
    mode                   TEXT CHECK(mode IN ('write', 'verify')),
    retry_count            INTEGER NOT NULL DEFAULT 0,
    max_retries            INTEGER NOT NULL,
    failure_signature      TEXT,
    previous_signatures    TEXT NOT NULL DEFAULT '[]',
    signature_repeat_count INTEGER NOT NULL DEFAULT 0,
    tier_floor             TEXT NOT NULL DEFAULT 'tier1' CHECK(tier_floor IN ('tier1', 'tier2', 'tier3')),
    halted                 INTEGER NOT NULL DEFAULT 0,
    claimed_by             TEXT,
    status_changed_at      TEXT,
    created_at             TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at             TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    CHECK (retry_count <= max_retries),
    CHECK (halted = (status = 'halted'))
);

CREATE TABLE IF NOT EXISTS item_deps (
    item       TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    depends_on TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    PRIMARY KEY (item, depends_on),
    CHECK (item != depends_on)
);

CREATE TABLE IF NOT EXISTS item_tests (
    item    TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    test_id TEXT NOT NULL,
    PRIMARY KEY (item, test_id)
);

CREATE TABLE IF NOT EXISTS notes (
    id         INTEGER PRIMARY KEY,
    item       TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS item_events (
    id         INTEGER PRIMARY KEY,
    item       TEXT NOT NULL,
    kind       TEXT NOT NULL,
    detail     TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS interventions (
    id                    INTEGER PRIMARY KEY,
    item                  TEXT NOT NULL UNIQUE REFERENCES items(id) ON DELETE CASCADE,
    signature             TEXT NOT NULL,
    root_cause            TEXT NOT NULL,
    error_message         TEXT NOT NULL,
    evidence              TEXT NOT NULL DEFAULT '[]',
    suggested_remediation TEXT NOT NULL,
    created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS id_sequences (
    prefix TEXT NOT NULL,
    day    TEXT NOT NULL,
    next   INTEGER NOT NULL,
    PRIMARY KEY (prefix, day)
);

CREATE INDEX IF NOT EXISTS items_status ON items(status);
CREATE INDEX IF NOT EXISTS item_deps_depends_on ON item_deps(depends_on);

CREATE TRIGGER IF NOT EXISTS item_events_append_only_update
BEFORE UPDATE ON item_events
BEGIN
    SELECT RAISE(ABORT, 'item_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS item_events_append_only_delete
BEFORE DELETE ON item_events
BEGIN
    SELECT RAISE(ABORT, 'item_events is append-only');
END;
";

fn set_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    set_pragmas(&conn)?;
    Ok(conn)
}

pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Open and initialise in one step, for callers that own their connection.
pub fn open_initialized(path: &str) -> Result<Connection> {
    let conn = open(path)?;
    init(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    set_pragmas(&conn)?;
    init(&conn)?;
    Ok(conn)
}

/// Run `f` as one atomic write. At top level this is `BEGIN IMMEDIATE`, which
/// takes the write lock up front so concurrent schedulers serialize here
/// instead of failing at commit. Inside an open transaction it nests as a
/// savepoint.
pub fn write_txn<T>(conn: &Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let (begin, commit, rollback) = if conn.is_autocommit() {
        ("BEGIN IMMEDIATE", "COMMIT", "ROLLBACK")
    } else {
        (
            "SAVEPOINT workq_nested",
            "RELEASE workq_nested",
            "ROLLBACK TO workq_nested; RELEASE workq_nested",
        )
    };
    conn.execute_batch(begin)?;
    match f() {
        Ok(v) => {
            conn.execute_batch(commit)?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch(rollback);
            Err(e)
        }
    }
}
