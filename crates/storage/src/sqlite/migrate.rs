use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates the step catalog, journey sessions with their completion rows,
/// the validation log, and indexes.
#[allow(clippy::too_many_lines)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS journeys (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS steps (
                    id INTEGER PRIMARY KEY,
                    journey_id INTEGER NOT NULL,
                    step_order INTEGER NOT NULL CHECK (step_order >= 0),
                    latitude REAL NOT NULL CHECK (latitude BETWEEN -90 AND 90),
                    longitude REAL NOT NULL CHECK (longitude BETWEEN -180 AND 180),
                    radius_meters REAL NOT NULL CHECK (radius_meters > 0),
                    points_awarded INTEGER NOT NULL CHECK (points_awarded >= 0),
                    UNIQUE (journey_id, step_order),
                    FOREIGN KEY (journey_id) REFERENCES journeys(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        // No foreign key to the catalog; it may live in another database.
        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS journey_sessions (
                    user_id TEXT NOT NULL,
                    journey_id INTEGER NOT NULL,
                    step_count INTEGER NOT NULL CHECK (step_count > 0),
                    current_step_index INTEGER NOT NULL CHECK (current_step_index >= 0),
                    completed_steps TEXT NOT NULL,
                    total_points_earned INTEGER NOT NULL CHECK (total_points_earned >= 0),
                    is_active INTEGER NOT NULL CHECK (is_active IN (0, 1)),
                    created_at TEXT NOT NULL,
                    last_activity_at TEXT NOT NULL,
                    completed_at TEXT,
                    abandoned_at TEXT,
                    version INTEGER NOT NULL CHECK (version >= 0),
                    PRIMARY KEY (user_id, journey_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS session_completions (
                    id INTEGER PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    journey_id INTEGER NOT NULL,
                    step_id INTEGER NOT NULL,
                    step_order INTEGER NOT NULL CHECK (step_order >= 0),
                    method TEXT NOT NULL,
                    completed_at TEXT NOT NULL,
                    UNIQUE (user_id, journey_id, step_id),
                    UNIQUE (user_id, journey_id, step_order),
                    FOREIGN KEY (user_id, journey_id)
                        REFERENCES journey_sessions(user_id, journey_id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS validation_log (
                    id INTEGER PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    journey_id INTEGER NOT NULL,
                    step_id INTEGER NOT NULL,
                    method TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    success INTEGER NOT NULL CHECK (success IN (0, 1)),
                    distance_meters REAL,
                    latitude REAL,
                    longitude REAL,
                    accuracy_meters REAL,
                    attempted_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_steps_journey_order
                    ON steps(journey_id, step_order);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_session_completions_session
                    ON session_completions(user_id, journey_id, id);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_validation_log_session_attempted
                    ON validation_log(user_id, journey_id, attempted_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
