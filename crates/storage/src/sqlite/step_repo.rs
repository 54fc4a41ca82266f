use journey_core::model::{Journey, JourneyId, Step, StepId};
use sqlx::Row;

use super::{
    SqliteRepository,
    mapping::{conn, id_i64, map_step_row, ser},
};
use crate::repository::{StepCatalog, StorageError};

fn insert_error(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict,
        _ => conn(e),
    }
}

#[async_trait::async_trait]
impl StepCatalog for SqliteRepository {
    async fn get_step(&self, id: StepId) -> Result<Step, StorageError> {
        let row = sqlx::query(
            r"
                SELECT id, journey_id, step_order, latitude, longitude, radius_meters, points_awarded
                FROM steps
                WHERE id = ?1
            ",
        )
        .bind(id_i64("step_id", id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;

        map_step_row(&row)
    }

    async fn get_journey(&self, id: JourneyId) -> Result<Journey, StorageError> {
        let journey_id = id_i64("journey_id", id.value())?;

        let row = sqlx::query("SELECT name FROM journeys WHERE id = ?1")
            .bind(journey_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        let name: String = row.try_get("name").map_err(ser)?;

        let rows = sqlx::query(
            r"
                SELECT id, journey_id, step_order, latitude, longitude, radius_meters, points_awarded
                FROM steps
                WHERE journey_id = ?1
                ORDER BY step_order ASC
            ",
        )
        .bind(journey_id)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            steps.push(map_step_row(&row)?);
        }

        Journey::new(id, name, steps).map_err(ser)
    }

    async fn upsert_journey(&self, journey: &Journey) -> Result<(), StorageError> {
        let journey_id = id_i64("journey_id", journey.id().value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        sqlx::query(
            r"
                INSERT INTO journeys (id, name)
                VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
        )
        .bind(journey_id)
        .bind(journey.name())
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        sqlx::query("DELETE FROM steps WHERE journey_id = ?1")
            .bind(journey_id)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;

        for step in journey.steps() {
            sqlx::query(
                r"
                    INSERT INTO steps (
                        id, journey_id, step_order, latitude, longitude,
                        radius_meters, points_awarded
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )
            .bind(id_i64("step_id", step.id().value())?)
            .bind(journey_id)
            .bind(i64::from(step.order()))
            .bind(step.location().latitude())
            .bind(step.location().longitude())
            .bind(step.validation_radius_meters())
            .bind(i64::from(step.points_awarded()))
            .execute(&mut *tx)
            .await
            .map_err(insert_error)?;
        }

        tx.commit().await.map_err(conn)?;
        tracing::debug!(journey_id = %journey.id(), steps = journey.steps().len(), "journey stored");
        Ok(())
    }
}
