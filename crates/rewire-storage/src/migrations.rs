use anyhow::Result;
use rusqlite::Connection;

/// Initialize database schema
///
/// # Errors
///
/// Returns an error if database table creation or index creation fails
pub fn init_schema(conn: &Connection) -> Result<()> {
    // Budget state - a single row, rewritten as a whole on every engine call
    conn.execute(
        "CREATE TABLE IF NOT EXISTS budget_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            remaining_units INTEGER NOT NULL,
            daily_session_count INTEGER NOT NULL,
            cost_factor_base REAL NOT NULL,
            compulsion_index REAL NOT NULL,
            daily_forbidden_time_ms INTEGER NOT NULL,
            daily_session_time_sum_ms INTEGER NOT NULL,
            last_budget_reset_date TEXT,
            last_forbidden_at TEXT
        )",
        [],
    )?;

    // Columns introduced after the first schema revision
    let columns_to_add = vec![
        ("last_decay_at", "TEXT"),
        ("compulsion_index_at_last_forbidden", "REAL NOT NULL DEFAULT 0"),
    ];

    for (column_name, column_type) in columns_to_add {
        let column_exists: Result<i32, rusqlite::Error> = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM pragma_table_info('budget_state') WHERE name='{column_name}'"
            ),
            [],
            |row| row.get(0),
        );

        if column_exists.unwrap_or(0) == 0 {
            conn.execute(
                &format!("ALTER TABLE budget_state ADD COLUMN {column_name} {column_type}"),
                [],
            )?;
            log::info!("Added {column_name} column to budget_state table");
        }
    }

    // Settings - user lists and the blocker switch
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            blocker_active INTEGER NOT NULL,
            extractive_apps TEXT NOT NULL DEFAULT '[]',
            forbidden_urls TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    // Session log - one row per closed sticky session
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            package TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,
            forbidden_ms INTEGER NOT NULL,
            units_charged INTEGER NOT NULL,
            reason TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_started_at ON sessions(started_at)",
        [],
    )?;

    Ok(())
}
