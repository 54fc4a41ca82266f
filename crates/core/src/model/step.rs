use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::Coordinate;
use crate::model::ids::{JourneyId, StepId};

//
// ─── ERRORS ───────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum StepError {
    #[error("validation radius must be finite and positive, got {0}")]
    InvalidRadius(f64),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum JourneyError {
    #[error("journey name cannot be empty")]
    EmptyName,

    #[error("journey must contain at least one step")]
    NoSteps,

    #[error("step {step_id} belongs to journey {found}, expected {expected}")]
    ForeignStep {
        step_id: StepId,
        expected: JourneyId,
        found: JourneyId,
    },

    #[error("duplicate step id {0}")]
    DuplicateStepId(StepId),

    #[error("step orders must be contiguous from 0; expected {expected}, found {found}")]
    NonContiguousOrder { expected: u32, found: u32 },

    #[error("journey has too many steps: {0}")]
    TooManySteps(usize),
}

//
// ─── STEP ─────────────────────────────────────────────────────────────────────
//

/// A single geofenced point of interest, owned by the content catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    id: StepId,
    journey_id: JourneyId,
    order: u32,
    location: Coordinate,
    validation_radius_meters: f64,
    points_awarded: u32,
}

#[derive(Serialize, Deserialize)]
struct RawStep {
    id: StepId,
    journey_id: JourneyId,
    order: u32,
    location: Coordinate,
    validation_radius_meters: f64,
    points_awarded: u32,
}

impl TryFrom<RawStep> for Step {
    type Error = StepError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        Step::new(
            raw.id,
            raw.journey_id,
            raw.order,
            raw.location,
            raw.validation_radius_meters,
            raw.points_awarded,
        )
    }
}

impl From<Step> for RawStep {
    fn from(s: Step) -> Self {
        Self {
            id: s.id,
            journey_id: s.journey_id,
            order: s.order,
            location: s.location,
            validation_radius_meters: s.validation_radius_meters,
            points_awarded: s.points_awarded,
        }
    }
}

impl Step {
    /// # Errors
    ///
    /// Returns `StepError::InvalidRadius` if the radius is not finite and positive.
    pub fn new(
        id: StepId,
        journey_id: JourneyId,
        order: u32,
        location: Coordinate,
        validation_radius_meters: f64,
        points_awarded: u32,
    ) -> Result<Self, StepError> {
        if !validation_radius_meters.is_finite() || validation_radius_meters <= 0.0 {
            return Err(StepError::InvalidRadius(validation_radius_meters));
        }
        Ok(Self {
            id,
            journey_id,
            order,
            location,
            validation_radius_meters,
            points_awarded,
        })
    }

    #[must_use]
    pub fn id(&self) -> StepId {
        self.id
    }

    #[must_use]
    pub fn journey_id(&self) -> JourneyId {
        self.journey_id
    }

    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[must_use]
    pub fn location(&self) -> Coordinate {
        self.location
    }

    #[must_use]
    pub fn validation_radius_meters(&self) -> f64 {
        self.validation_radius_meters
    }

    #[must_use]
    pub fn points_awarded(&self) -> u32 {
        self.points_awarded
    }
}

//
// ─── JOURNEY ──────────────────────────────────────────────────────────────────
//

/// An ordered sequence of steps. Orders always run `0..step_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawJourney", into = "RawJourney")]
pub struct Journey {
    id: JourneyId,
    name: String,
    steps: Vec<Step>,
}

#[derive(Serialize, Deserialize)]
struct RawJourney {
    id: JourneyId,
    name: String,
    steps: Vec<Step>,
}

impl TryFrom<RawJourney> for Journey {
    type Error = JourneyError;

    fn try_from(raw: RawJourney) -> Result<Self, Self::Error> {
        Journey::new(raw.id, raw.name, raw.steps)
    }
}

impl From<Journey> for RawJourney {
    fn from(j: Journey) -> Self {
        Self {
            id: j.id,
            name: j.name,
            steps: j.steps,
        }
    }
}

impl Journey {
    /// Build a journey, sorting steps by order and checking the catalog shape.
    ///
    /// # Errors
    ///
    /// Returns `JourneyError` if the name is blank, there are no steps, a step
    /// belongs to another journey, ids repeat, or orders are not `0..n`.
    pub fn new(
        id: JourneyId,
        name: impl Into<String>,
        mut steps: Vec<Step>,
    ) -> Result<Self, JourneyError> {
        let name = name.into().trim().to_owned();
        if name.is_empty() {
            return Err(JourneyError::EmptyName);
        }
        if steps.is_empty() {
            return Err(JourneyError::NoSteps);
        }
        if u32::try_from(steps.len()).is_err() {
            return Err(JourneyError::TooManySteps(steps.len()));
        }

        steps.sort_by_key(Step::order);

        let mut seen = HashSet::with_capacity(steps.len());
        for (expected, step) in (0_u32..).zip(steps.iter()) {
            if step.journey_id != id {
                return Err(JourneyError::ForeignStep {
                    step_id: step.id,
                    expected: id,
                    found: step.journey_id,
                });
            }
            if !seen.insert(step.id) {
                return Err(JourneyError::DuplicateStepId(step.id));
            }
            if step.order != expected {
                return Err(JourneyError::NonContiguousOrder {
                    expected,
                    found: step.order,
                });
            }
        }

        Ok(Self { id, name, steps })
    }

    #[must_use]
    pub fn id(&self) -> JourneyId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn step_count(&self) -> u32 {
        // Bounded by the constructor.
        u32::try_from(self.steps.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    #[must_use]
    pub fn step_at(&self, order: u32) -> Option<&Step> {
        usize::try_from(order).ok().and_then(|i| self.steps.get(i))
    }

    /// Canonical point total for a set of completed step orders.
    ///
    /// Orders outside the catalog contribute nothing.
    #[must_use]
    pub fn total_points_for(&self, completed: &BTreeSet<u32>) -> u64 {
        completed
            .iter()
            .filter_map(|order| self.step_at(*order))
            .map(|s| u64::from(s.points_awarded))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(lat: f64) -> Coordinate {
        Coordinate::new(lat, 2.35).unwrap()
    }

    fn step(id: u64, order: u32, points: u32) -> Step {
        Step::new(StepId::new(id), JourneyId::new(1), order, at(48.85), 50.0, points).unwrap()
    }

    #[test]
    fn step_rejects_bad_radius() {
        for radius in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let err =
                Step::new(StepId::new(1), JourneyId::new(1), 0, at(1.0), radius, 1).unwrap_err();
            assert!(matches!(err, StepError::InvalidRadius(_)));
        }
    }

    #[test]
    fn journey_sorts_steps_by_order() {
        let journey = Journey::new(
            JourneyId::new(1),
            "Old Town",
            vec![step(12, 2, 20), step(10, 0, 10), step(11, 1, 15)],
        )
        .unwrap();

        let orders: Vec<_> = journey.steps().iter().map(Step::order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(journey.step_count(), 3);
        assert_eq!(journey.step(StepId::new(11)).unwrap().order(), 1);
    }

    #[test]
    fn journey_rejects_gaps_and_duplicates() {
        let gap = Journey::new(JourneyId::new(1), "J", vec![step(1, 0, 1), step(2, 2, 1)]);
        assert!(matches!(
            gap,
            Err(JourneyError::NonContiguousOrder {
                expected: 1,
                found: 2
            })
        ));

        let dup = Journey::new(JourneyId::new(1), "J", vec![step(1, 0, 1), step(1, 1, 1)]);
        assert!(matches!(dup, Err(JourneyError::DuplicateStepId(_))));

        let empty = Journey::new(JourneyId::new(1), "J", Vec::new());
        assert!(matches!(empty, Err(JourneyError::NoSteps)));

        let blank = Journey::new(JourneyId::new(1), "  ", vec![step(1, 0, 1)]);
        assert!(matches!(blank, Err(JourneyError::EmptyName)));
    }

    #[test]
    fn journey_rejects_foreign_steps() {
        let foreign =
            Step::new(StepId::new(9), JourneyId::new(2), 0, at(1.0), 10.0, 1).unwrap();
        let err = Journey::new(JourneyId::new(1), "J", vec![foreign]).unwrap_err();
        assert!(matches!(err, JourneyError::ForeignStep { .. }));
    }

    #[test]
    fn deserializing_rechecks_the_catalog_shape() {
        let journey = Journey::new(
            JourneyId::new(1),
            "J",
            vec![step(1, 0, 10), step(2, 1, 15)],
        )
        .unwrap();
        let value = serde_json::to_value(&journey).unwrap();
        let back: Journey = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(back, journey);

        let mut zero_radius = value.clone();
        zero_radius["steps"][0]["validation_radius_meters"] = serde_json::json!(0.0);
        assert!(serde_json::from_value::<Journey>(zero_radius).is_err());

        let mut gap = value.clone();
        gap["steps"][1]["order"] = serde_json::json!(5);
        assert!(serde_json::from_value::<Journey>(gap).is_err());

        let mut dup = value;
        let first_id = dup["steps"][0]["id"].clone();
        dup["steps"][1]["id"] = first_id;
        assert!(serde_json::from_value::<Journey>(dup).is_err());
    }

    #[test]
    fn total_points_uses_catalog_values() {
        let journey = Journey::new(
            JourneyId::new(1),
            "J",
            vec![step(1, 0, 10), step(2, 1, 15), step(3, 2, 20)],
        )
        .unwrap();

        let completed: BTreeSet<u32> = [0, 2, 7].into_iter().collect();
        assert_eq!(journey.total_points_for(&completed), 30);
    }
}
