use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and an index on `paused` so the
/// recovery query stays cheap with thousands of stored jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                    INTEGER NOT NULL PRIMARY KEY,
            group_id              INTEGER NOT NULL,
            super_group_id        INTEGER NOT NULL,
            recurrence_expression TEXT    NOT NULL,
            paused                INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT    NOT NULL,   -- RFC 3339
            updated_at            TEXT    NOT NULL,   -- RFC 3339
            engine_handle         TEXT,               -- UUID or NULL, informational
            behavior_payload      BLOB    NOT NULL,
            input_payload         BLOB    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_paused ON jobs (paused);
        ",
    )?;
    Ok(())
}
