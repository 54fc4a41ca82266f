use chrono::{DateTime, Utc};
use journey_core::model::{JourneySession, SessionKey};
use sqlx::SqliteConnection;

use super::{
    SqliteRepository,
    mapping::{
        completed_steps_json, conn, id_i64, map_completion_row, map_session_row, user_id_to_text,
    },
};
use crate::repository::{
    CommitOutcome, CommitPlan, SessionRepository, StepCompletion, StorageError, plan_commit,
};

/// How many times `abandon` re-reads after losing a version race.
const ABANDON_ATTEMPTS: usize = 3;

fn version_i64(session: &JourneySession) -> Result<i64, StorageError> {
    id_i64("version", session.version())
}

async fn load_session(
    db: &mut SqliteConnection,
    key: SessionKey,
) -> Result<Option<JourneySession>, StorageError> {
    let user_id = user_id_to_text(key.user_id);
    let journey_id = id_i64("journey_id", key.journey_id.value())?;

    let Some(row) = sqlx::query(
        r"
            SELECT
                user_id, journey_id, step_count, current_step_index, completed_steps,
                total_points_earned, is_active, created_at, last_activity_at,
                completed_at, abandoned_at, version
            FROM journey_sessions
            WHERE user_id = ?1 AND journey_id = ?2
        ",
    )
    .bind(&user_id)
    .bind(journey_id)
    .fetch_optional(&mut *db)
    .await
    .map_err(conn)?
    else {
        return Ok(None);
    };

    let completion_rows = sqlx::query(
        r"
            SELECT step_id, method, completed_at
            FROM session_completions
            WHERE user_id = ?1 AND journey_id = ?2
            ORDER BY id ASC
        ",
    )
    .bind(&user_id)
    .bind(journey_id)
    .fetch_all(&mut *db)
    .await
    .map_err(conn)?;

    let mut history = Vec::with_capacity(completion_rows.len());
    for r in completion_rows {
        history.push(map_completion_row(&r)?);
    }

    map_session_row(&row, history).map(Some)
}

impl SqliteRepository {
    /// Session row and completion rows come from one read transaction.
    async fn load(&self, key: SessionKey) -> Result<Option<JourneySession>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;
        let session = load_session(&mut tx, key).await?;
        tx.commit().await.map_err(conn)?;
        Ok(session)
    }

    /// Write `next` under a version check. `None` if the row moved on.
    async fn write_completion(
        &self,
        completion: &StepCompletion,
        expected_version: u64,
        next: &JourneySession,
    ) -> Result<Option<JourneySession>, StorageError> {
        let user_id = user_id_to_text(completion.key.user_id);
        let journey_id = id_i64("journey_id", completion.key.journey_id.value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        // The unique (session, step) row is the backstop against two writers
        // racing on the same step.
        let inserted = sqlx::query(
            r"
                INSERT INTO session_completions (
                    user_id, journey_id, step_id, step_order, method, completed_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT DO NOTHING
            ",
        )
        .bind(&user_id)
        .bind(journey_id)
        .bind(id_i64("step_id", completion.step.id().value())?)
        .bind(i64::from(completion.step.order()))
        .bind(completion.method.as_str())
        .bind(completion.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(conn)?;
            return Ok(None);
        }

        let total_points = i64::try_from(next.total_points_earned())
            .map_err(|_| StorageError::Serialization("total_points_earned overflow".into()))?;

        let updated = sqlx::query(
            r"
                UPDATE journey_sessions SET
                    current_step_index = ?3,
                    completed_steps = ?4,
                    total_points_earned = ?5,
                    is_active = ?6,
                    last_activity_at = CASE
                        WHEN last_activity_at > ?7 THEN last_activity_at
                        ELSE ?7
                    END,
                    completed_at = ?8,
                    version = ?9
                WHERE user_id = ?1 AND journey_id = ?2 AND version = ?10 AND is_active = 1
            ",
        )
        .bind(&user_id)
        .bind(journey_id)
        .bind(i64::from(next.current_step_index()))
        .bind(completed_steps_json(next)?)
        .bind(total_points)
        .bind(i64::from(next.is_active()))
        .bind(next.last_activity_at())
        .bind(next.completed_at())
        .bind(version_i64(next)?)
        .bind(id_i64("version", expected_version)?)
        .execute(&mut *tx)
        .await
        .map_err(conn)?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.map_err(conn)?;
            return Ok(None);
        }

        let stored = load_session(&mut tx, completion.key)
            .await?
            .ok_or(StorageError::NotFound)?;
        tx.commit().await.map_err(conn)?;
        Ok(Some(stored))
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqliteRepository {
    async fn get_or_create(
        &self,
        key: SessionKey,
        step_count: u32,
        now: DateTime<Utc>,
    ) -> Result<JourneySession, StorageError> {
        let fresh = JourneySession::new(key, step_count, now)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        // Insert-if-absent; whoever loses the race reads the winner's row.
        sqlx::query(
            r"
                INSERT INTO journey_sessions (
                    user_id, journey_id, step_count, current_step_index, completed_steps,
                    total_points_earned, is_active, created_at, last_activity_at,
                    completed_at, abandoned_at, version
                )
                VALUES (?1, ?2, ?3, 0, ?4, 0, 1, ?5, ?5, NULL, NULL, 0)
                ON CONFLICT(user_id, journey_id) DO NOTHING
            ",
        )
        .bind(user_id_to_text(key.user_id))
        .bind(id_i64("journey_id", key.journey_id.value())?)
        .bind(i64::from(step_count))
        .bind(completed_steps_json(&fresh)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        self.load(key).await?.ok_or(StorageError::NotFound)
    }

    async fn get_session(&self, key: SessionKey) -> Result<Option<JourneySession>, StorageError> {
        self.load(key).await
    }

    async fn commit_step_completion(
        &self,
        completion: &StepCompletion,
        expected_version: u64,
    ) -> Result<CommitOutcome, StorageError> {
        let stored = self
            .load(completion.key)
            .await?
            .ok_or(StorageError::NotFound)?;

        let next = match plan_commit(&stored, completion, expected_version)? {
            CommitPlan::Done(outcome) => return Ok(outcome),
            CommitPlan::Apply(next) => next,
        };

        if let Some(written) = self
            .write_completion(completion, expected_version, &next)
            .await?
        {
            return Ok(CommitOutcome::Committed(written));
        }

        // Lost the write: classify against what is stored now.
        let current = self
            .load(completion.key)
            .await?
            .ok_or(StorageError::NotFound)?;
        if !current.is_active() {
            return Ok(CommitOutcome::Inactive(current));
        }
        if current.is_step_completed(completion.step.order()) {
            return Ok(CommitOutcome::AlreadyCompleted(current));
        }
        Ok(CommitOutcome::VersionConflict)
    }

    async fn touch(&self, key: SessionKey, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            r"
                UPDATE journey_sessions
                SET last_activity_at = ?3
                WHERE user_id = ?1 AND journey_id = ?2 AND last_activity_at < ?3
            ",
        )
        .bind(user_id_to_text(key.user_id))
        .bind(id_i64("journey_id", key.journey_id.value())?)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(())
    }

    async fn abandon(
        &self,
        key: SessionKey,
        at: DateTime<Utc>,
    ) -> Result<Option<JourneySession>, StorageError> {
        for _ in 0..ABANDON_ATTEMPTS {
            let Some(mut session) = self.load(key).await? else {
                return Ok(None);
            };
            let expected = version_i64(&session)?;
            if !session.abandon(at) {
                return Ok(Some(session));
            }

            let updated = sqlx::query(
                r"
                    UPDATE journey_sessions SET
                        is_active = 0,
                        abandoned_at = ?3,
                        last_activity_at = CASE
                            WHEN last_activity_at > ?3 THEN last_activity_at
                            ELSE ?3
                        END,
                        version = ?4
                    WHERE user_id = ?1 AND journey_id = ?2 AND version = ?5 AND is_active = 1
                ",
            )
            .bind(user_id_to_text(key.user_id))
            .bind(id_i64("journey_id", key.journey_id.value())?)
            .bind(at)
            .bind(version_i64(&session)?)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(conn)?
            .rows_affected();

            if updated == 1 {
                return self.load(key).await;
            }
            tracing::debug!(?key, "abandon lost a version race, re-reading");
        }
        Err(StorageError::Conflict)
    }
}
