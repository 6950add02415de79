use rusqlite::Connection;

use crate::error::Result;

/// Initialise the orchestration schema in `conn`.
///
/// Idempotent. Timestamps are RFC 3339 strings in UTC; list-valued columns
/// (`target_countries`, `target_platforms`, `args_idx`, `extra`) hold JSON.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS active_probes (
            id                TEXT    NOT NULL PRIMARY KEY,
            probe_cc          TEXT    NOT NULL DEFAULT '',
            platform          TEXT    NOT NULL,
            token             TEXT    NOT NULL DEFAULT '',
            is_token_expired  INTEGER NOT NULL DEFAULT 0,
            software_name     TEXT,
            software_version  TEXT,
            last_updated      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_active_probes_cc ON active_probes (probe_cc);

        CREATE TABLE IF NOT EXISTS job_alerts (
            alert_no  INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            message   TEXT    NOT NULL,
            extra     TEXT    NOT NULL DEFAULT '{}'
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_experiments (
            experiment_no      INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            test_name          TEXT    NOT NULL,
            signing_key_id     TEXT    NOT NULL,
            signed_experiment  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS jobs (
            id                TEXT    NOT NULL PRIMARY KEY,
            comment           TEXT    NOT NULL DEFAULT '',
            schedule          TEXT    NOT NULL,   -- canonical R<n>/<start>/P<period>
            delay             INTEGER NOT NULL DEFAULT 0,
            target_countries  TEXT    NOT NULL DEFAULT '[]',
            target_platforms  TEXT    NOT NULL DEFAULT '[]',
            creation_time     TEXT    NOT NULL,
            times_run         INTEGER NOT NULL DEFAULT 0,
            next_run_at       TEXT    NOT NULL,
            is_done           INTEGER NOT NULL DEFAULT 0,
            state             TEXT    NOT NULL DEFAULT 'active',
            alert_no          INTEGER REFERENCES job_alerts (alert_no),
            experiment_no     INTEGER REFERENCES job_experiments (experiment_no),
            CHECK ((alert_no IS NULL) <> (experiment_no IS NULL))
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state, is_done);

        CREATE TABLE IF NOT EXISTS client_experiments (
            id                 TEXT    NOT NULL PRIMARY KEY,
            probe_id           TEXT    NOT NULL,
            job_id             TEXT    NOT NULL,
            experiment_no      INTEGER NOT NULL,
            args_idx           TEXT    NOT NULL DEFAULT '[]',
            state              TEXT    NOT NULL DEFAULT 'ready',
            progress           INTEGER NOT NULL DEFAULT 0,
            creation_time      TEXT    NOT NULL,
            notification_time  TEXT,
            accept_time        TEXT,
            done_time          TEXT,
            last_updated       TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_client_experiments_probe
            ON client_experiments (probe_id, state);

        CREATE TABLE IF NOT EXISTS signing_keys (
            key_id          TEXT NOT NULL PRIMARY KEY,
            public_key_pem  TEXT NOT NULL,
            created_at      TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
