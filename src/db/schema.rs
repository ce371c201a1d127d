//! Database schema definitions

pub const CREATE_IP_BLOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ip_blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cidr TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
    source_file TEXT,
    added_at BIGINT NOT NULL
)
"#;

// remaining is a JSON array of unused pool indices
pub const CREATE_SAMPLER_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sampler_state (
    namespace TEXT PRIMARY KEY,
    total INTEGER NOT NULL,
    remaining TEXT NOT NULL,
    cycle INTEGER NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    started_at BIGINT NOT NULL,
    ended_at BIGINT,
    initiated_by TEXT NOT NULL CHECK (initiated_by IN ('scheduler', 'dashboard', 'manual')),
    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    blocks_scanned INTEGER NOT NULL DEFAULT 0,
    ips_found INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_RUN_BLOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS run_blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    ip_block TEXT NOT NULL,
    picked_at BIGINT NOT NULL,
    block_source_file TEXT,
    block_namespace TEXT NOT NULL
)
"#;

pub const CREATE_ENDPOINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS endpoints (
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    source TEXT NOT NULL,
    first_seen BIGINT NOT NULL,
    last_seen BIGINT NOT NULL,
    seen_count INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (run_id, ip, port, source)
)
"#;

pub const CREATE_BLOCK_ENDPOINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS block_endpoints (
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    ip_block TEXT NOT NULL,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    source TEXT NOT NULL,
    first_seen BIGINT NOT NULL,
    last_seen BIGINT NOT NULL,
    seen_count INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (run_id, ip_block, ip, port, source)
)
"#;

// Single row, id pinned to 1. last_exit is JSON: {"code":0,"signal":null,"error":null}
pub const CREATE_SCHEDULER_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scheduler_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    armed INTEGER NOT NULL DEFAULT 0,
    delay_seconds INTEGER NOT NULL,
    next_run_at BIGINT,
    running INTEGER NOT NULL DEFAULT 0,
    started_by_dashboard INTEGER NOT NULL DEFAULT 0,
    last_exit TEXT,
    run_pid INTEGER,
    updated_at BIGINT NOT NULL
)
"#;

pub const CREATE_INDEX_BLOCKS_ENABLED: &str =
    "CREATE INDEX IF NOT EXISTS idx_ip_blocks_enabled ON ip_blocks(enabled, id)";

pub const CREATE_INDEX_RUNS_STARTED: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at DESC)";

pub const CREATE_INDEX_RUN_BLOCKS_RUN: &str =
    "CREATE INDEX IF NOT EXISTS idx_run_blocks_run ON run_blocks(run_id, id)";

// For distinct-address counts at run finalization
pub const CREATE_INDEX_ENDPOINTS_RUN_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_endpoints_run_ip ON endpoints(run_id, ip)";

pub const MIGRATIONS: &[&str] = &[
    CREATE_IP_BLOCKS_TABLE,
    CREATE_SAMPLER_STATE_TABLE,
    CREATE_RUNS_TABLE,
    CREATE_RUN_BLOCKS_TABLE,
    CREATE_ENDPOINTS_TABLE,
    CREATE_BLOCK_ENDPOINTS_TABLE,
    CREATE_SCHEDULER_STATE_TABLE,
    CREATE_INDEX_BLOCKS_ENABLED,
    CREATE_INDEX_RUNS_STARTED,
    CREATE_INDEX_RUN_BLOCKS_RUN,
    CREATE_INDEX_ENDPOINTS_RUN_IP,
];
