use anyhow::Result;
use sqlx::SqlitePool;

/// Create the vizchat tables if they do not exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS datasets (
            id TEXT PRIMARY KEY,
            uri TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            column_properties_json TEXT,
            dataset_schema_json TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            id TEXT PRIMARY KEY,
            dataset_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (dataset_id) REFERENCES datasets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_turns (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            question TEXT NOT NULL,
            reply_to TEXT,
            created_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES chat_sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // parent_user_turn_id is a lookup key, not an owning reference
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assistant_turns (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            parent_user_turn_id TEXT,
            viz_name TEXT NOT NULL,
            columns_involved_json TEXT NOT NULL DEFAULT '[]',
            reason TEXT NOT NULL DEFAULT '',
            extract_code TEXT NOT NULL DEFAULT '',
            render_code TEXT NOT NULL DEFAULT '',
            svg_json TEXT NOT NULL DEFAULT '',
            data_json TEXT NOT NULL DEFAULT '[]',
            extra_attrs_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES chat_sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_user_turns_session ON user_turns(session_id, seq DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_assistant_turns_session ON assistant_turns(session_id, seq)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
