//! SQL schema for the Effector SQLite store.
//!
//! Executed once at connection startup. `PRAGMA user_version` records the
//! schema revision; future migrations will be gated on it.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- ── Impact matrix ──────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS actions (
    action_name TEXT PRIMARY KEY,
    module      TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    description TEXT
);

CREATE TABLE IF NOT EXISTS effect_types (
    effect_type TEXT PRIMARY KEY,
    category    TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    description TEXT
);

CREATE TABLE IF NOT EXISTS impact_mappings (
    action_name TEXT NOT NULL REFERENCES actions(action_name),
    effect_type TEXT NOT NULL REFERENCES effect_types(effect_type),
    priority    INTEGER NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (action_name, effect_type)
);

-- ── Dispatch state ─────────────────────────────────────────────────────────

-- Strictly append-only. No UPDATE or DELETE is ever issued against it.
CREATE TABLE IF NOT EXISTS system_events (
    id          TEXT PRIMARY KEY,
    event_name  TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    module      TEXT NOT NULL,
    occurred_at TEXT NOT NULL,   -- RFC 3339 UTC; server-assigned
    payload     TEXT NOT NULL    -- JSON
);

CREATE TABLE IF NOT EXISTS outbox (
    id            TEXT PRIMARY KEY,
    event_id      TEXT NOT NULL UNIQUE REFERENCES system_events(id),
    status        TEXT NOT NULL,   -- 'pending' | 'processing' | 'completed' | 'failed'
    retry_count   INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    created_at    TEXT NOT NULL,
    processed_at  TEXT,
    claimed_by    TEXT,
    claimed_until TEXT,
    available_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS effect_runs (
    id            TEXT PRIMARY KEY,
    event_id      TEXT NOT NULL REFERENCES system_events(id),
    effect_type   TEXT NOT NULL,
    priority      INTEGER NOT NULL,
    status        TEXT NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    UNIQUE (event_id, effect_type)
);

CREATE TABLE IF NOT EXISTS event_metrics (
    event_name  TEXT PRIMARY KEY,
    event_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS events_name_idx        ON system_events(event_name);
CREATE INDEX IF NOT EXISTS events_occurred_idx    ON system_events(occurred_at);
CREATE INDEX IF NOT EXISTS outbox_claimable_idx   ON outbox(status, available_at);
CREATE INDEX IF NOT EXISTS outbox_claimed_idx     ON outbox(status, claimed_until);
CREATE INDEX IF NOT EXISTS effect_runs_event_idx  ON effect_runs(event_id);
CREATE INDEX IF NOT EXISTS effect_runs_status_idx ON effect_runs(status);

PRAGMA user_version = 1;
";
