use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use journey_core::geo::Coordinate;
use journey_core::model::{
    JourneyId, JourneySession, ReportedLocation, SessionKey, SessionSnapshot, Step, StepId,
    UserId, ValidationMethod, ValidationRecord,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::{LogOutcome, StorageError, ValidationLogRecord};

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

pub(crate) fn id_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn i64_to_u32(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn journey_id_from_i64(v: i64) -> Result<JourneyId, StorageError> {
    Ok(JourneyId::new(i64_to_u64("journey_id", v)?))
}

pub(crate) fn step_id_from_i64(v: i64) -> Result<StepId, StorageError> {
    Ok(StepId::new(i64_to_u64("step_id", v)?))
}

pub(crate) fn user_id_to_text(id: UserId) -> String {
    id.value().to_string()
}

fn user_id_from_text(s: &str) -> Result<UserId, StorageError> {
    s.parse::<UserId>().map_err(ser)
}

pub(crate) fn parse_method(s: &str) -> Result<ValidationMethod, StorageError> {
    ValidationMethod::parse(s).map_err(ser)
}

pub(crate) fn map_step_row(row: &SqliteRow) -> Result<Step, StorageError> {
    let location = Coordinate::new(
        row.try_get("latitude").map_err(ser)?,
        row.try_get("longitude").map_err(ser)?,
    )
    .map_err(ser)?;

    Step::new(
        step_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?,
        journey_id_from_i64(row.try_get::<i64, _>("journey_id").map_err(ser)?)?,
        i64_to_u32("step_order", row.try_get::<i64, _>("step_order").map_err(ser)?)?,
        location,
        row.try_get("radius_meters").map_err(ser)?,
        i64_to_u32(
            "points_awarded",
            row.try_get::<i64, _>("points_awarded").map_err(ser)?,
        )?,
    )
    .map_err(ser)
}

pub(crate) fn map_completion_row(row: &SqliteRow) -> Result<ValidationRecord, StorageError> {
    let method: String = row.try_get("method").map_err(ser)?;
    Ok(ValidationRecord {
        step_id: step_id_from_i64(row.try_get::<i64, _>("step_id").map_err(ser)?)?,
        at: row.try_get("completed_at").map_err(ser)?,
        method: parse_method(&method)?,
        success: true,
    })
}

/// Rebuild a session from its row plus its completion rows.
pub(crate) fn map_session_row(
    row: &SqliteRow,
    history: Vec<ValidationRecord>,
) -> Result<JourneySession, StorageError> {
    let user_id: String = row.try_get("user_id").map_err(ser)?;
    let key = SessionKey::new(
        user_id_from_text(&user_id)?,
        journey_id_from_i64(row.try_get::<i64, _>("journey_id").map_err(ser)?)?,
    );

    let completed_json: String = row.try_get("completed_steps").map_err(ser)?;
    let completed_steps: BTreeSet<u32> = serde_json::from_str(&completed_json).map_err(ser)?;
    let is_active: i64 = row.try_get("is_active").map_err(ser)?;

    let snapshot = SessionSnapshot {
        key,
        step_count: i64_to_u32("step_count", row.try_get::<i64, _>("step_count").map_err(ser)?)?,
        current_step_index: i64_to_u32(
            "current_step_index",
            row.try_get::<i64, _>("current_step_index").map_err(ser)?,
        )?,
        completed_steps,
        total_points_earned: i64_to_u64(
            "total_points_earned",
            row.try_get::<i64, _>("total_points_earned").map_err(ser)?,
        )?,
        is_active: is_active != 0,
        validation_history: history,
        created_at: row.try_get("created_at").map_err(ser)?,
        last_activity_at: row.try_get("last_activity_at").map_err(ser)?,
        completed_at: row.try_get("completed_at").map_err(ser)?,
        abandoned_at: row.try_get("abandoned_at").map_err(ser)?,
        version: i64_to_u64("version", row.try_get::<i64, _>("version").map_err(ser)?)?,
    };

    JourneySession::from_snapshot(snapshot).map_err(ser)
}

pub(crate) fn completed_steps_json(session: &JourneySession) -> Result<String, StorageError> {
    serde_json::to_string(session.completed_steps()).map_err(ser)
}

pub(crate) fn map_log_row(row: &SqliteRow) -> Result<ValidationLogRecord, StorageError> {
    let user_id: String = row.try_get("user_id").map_err(ser)?;
    let key = SessionKey::new(
        user_id_from_text(&user_id)?,
        journey_id_from_i64(row.try_get::<i64, _>("journey_id").map_err(ser)?)?,
    );
    let method: String = row.try_get("method").map_err(ser)?;
    let outcome: String = row.try_get("outcome").map_err(ser)?;

    let latitude: Option<f64> = row.try_get("latitude").map_err(ser)?;
    let longitude: Option<f64> = row.try_get("longitude").map_err(ser)?;
    let location = match (latitude, longitude) {
        (Some(lat), Some(lon)) => Some(ReportedLocation::new(
            Coordinate::new(lat, lon).map_err(ser)?,
            row.try_get("accuracy_meters").map_err(ser)?,
        )),
        _ => None,
    };

    let attempted_at: DateTime<Utc> = row.try_get("attempted_at").map_err(ser)?;
    Ok(ValidationLogRecord {
        id: Some(row.try_get("id").map_err(ser)?),
        key,
        step_id: step_id_from_i64(row.try_get::<i64, _>("step_id").map_err(ser)?)?,
        method: parse_method(&method)?,
        outcome: LogOutcome::parse(&outcome)?,
        distance_meters: row.try_get("distance_meters").map_err(ser)?,
        location,
        attempted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_ids_are_rejected() {
        assert!(step_id_from_i64(-1).is_err());
        assert_eq!(journey_id_from_i64(4).unwrap(), JourneyId::new(4));
    }

    #[test]
    fn oversized_ids_are_rejected() {
        assert!(id_i64("step_id", u64::MAX).is_err());
        assert_eq!(id_i64("step_id", 9).unwrap(), 9);
    }

    #[test]
    fn unknown_method_is_a_serialization_error() {
        assert!(matches!(
            parse_method("carrier_pigeon"),
            Err(StorageError::Serialization(_))
        ));
    }
}
