use journey_core::model::SessionKey;

use super::{
    SqliteRepository,
    mapping::{conn, id_i64, map_log_row, user_id_to_text},
};
use crate::repository::{StorageError, ValidationLogRecord, ValidationLogRepository};

#[async_trait::async_trait]
impl ValidationLogRepository for SqliteRepository {
    async fn append(&self, entry: ValidationLogRecord) -> Result<i64, StorageError> {
        let (latitude, longitude, accuracy) = match entry.location {
            Some(loc) => (
                Some(loc.coordinate.latitude()),
                Some(loc.coordinate.longitude()),
                loc.accuracy_meters,
            ),
            None => (None, None, None),
        };

        let res = sqlx::query(
            r"
                INSERT INTO validation_log (
                    user_id, journey_id, step_id, method, outcome, success,
                    distance_meters, latitude, longitude, accuracy_meters, attempted_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
        )
        .bind(user_id_to_text(entry.key.user_id))
        .bind(id_i64("journey_id", entry.key.journey_id.value())?)
        .bind(id_i64("step_id", entry.step_id.value())?)
        .bind(entry.method.as_str())
        .bind(entry.outcome.as_str())
        .bind(i64::from(entry.success()))
        .bind(entry.distance_meters)
        .bind(latitude)
        .bind(longitude)
        .bind(accuracy)
        .bind(entry.attempted_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(res.last_insert_rowid())
    }

    async fn entries_for_session(
        &self,
        key: SessionKey,
    ) -> Result<Vec<ValidationLogRecord>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT
                    id, user_id, journey_id, step_id, method, outcome,
                    distance_meters, latitude, longitude, accuracy_meters, attempted_at
                FROM validation_log
                WHERE user_id = ?1 AND journey_id = ?2
                ORDER BY id ASC
            ",
        )
        .bind(user_id_to_text(key.user_id))
        .bind(id_i64("journey_id", key.journey_id.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_log_row(&row)?);
        }
        Ok(out)
    }
}
