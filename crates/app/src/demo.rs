use journey_core::geo::Coordinate;
use journey_core::model::{Journey, JourneyId, Step, StepId};

pub const DEMO_JOURNEY_ID: JourneyId = JourneyId::new(1);

/// Three-stop walk along the Seine used by `journey seed`.
///
/// # Errors
///
/// Returns `journey_core::Error` if any of the fixed coordinates or steps fail
/// validation.
pub fn demo_journey() -> Result<Journey, journey_core::Error> {
    let stops = [
        (StepId::new(1), 48.861_0, 2.335_8, 50.0, 10),
        (StepId::new(2), 48.858_3, 2.337_5, 30.0, 15),
        (StepId::new(3), 48.853_0, 2.349_9, 100.0, 20),
    ];

    let mut steps = Vec::with_capacity(stops.len());
    for (order, (id, lat, lon, radius, points)) in (0_u32..).zip(stops) {
        let location = Coordinate::new(lat, lon)?;
        steps.push(Step::new(id, DEMO_JOURNEY_ID, order, location, radius, points)?);
    }

    Ok(Journey::new(DEMO_JOURNEY_ID, "Seine Walk", steps)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn demo_journey_is_valid_and_worth_45_points() {
        let journey = demo_journey().unwrap();
        assert_eq!(journey.step_count(), 3);

        let all: BTreeSet<u32> = (0..3).collect();
        assert_eq!(journey.total_points_for(&all), 45);
        assert_eq!(journey.step_at(1).unwrap().validation_radius_meters(), 30.0);
    }
}
