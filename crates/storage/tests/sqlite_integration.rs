use chrono::Duration;
use journey_core::geo::Coordinate;
use journey_core::model::{
    Journey, JourneyId, ReportedLocation, SessionKey, Step, StepId, UserId, ValidationMethod,
};
use journey_core::time::fixed_now;
use storage::repository::{
    CommitOutcome, LogOutcome, SessionRepository, StepCatalog, StepCompletion, StorageError,
    ValidationLogRecord, ValidationLogRepository,
};
use storage::sqlite::SqliteRepository;

async fn repo(name: &str) -> SqliteRepository {
    let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

fn walk() -> Journey {
    let base = Coordinate::new(48.8566, 2.3522).unwrap();
    let steps = vec![
        Step::new(StepId::new(11), JourneyId::new(1), 0, base, 50.0, 10).unwrap(),
        Step::new(
            StepId::new(12),
            JourneyId::new(1),
            1,
            base.offset_north(500.0).unwrap(),
            30.0,
            15,
        )
        .unwrap(),
        Step::new(
            StepId::new(13),
            JourneyId::new(1),
            2,
            base.offset_north(1_000.0).unwrap(),
            100.0,
            20,
        )
        .unwrap(),
    ];
    Journey::new(JourneyId::new(1), "River Walk", steps).unwrap()
}

fn completion(key: SessionKey, step: &Step, minutes: i64) -> StepCompletion {
    StepCompletion {
        key,
        step: step.clone(),
        method: ValidationMethod::Geolocation,
        completed_at: fixed_now() + Duration::minutes(minutes),
    }
}

#[tokio::test]
async fn sqlite_catalog_roundtrip_and_replace() {
    let repo = repo("memdb_catalog").await;
    let journey = walk();
    repo.upsert_journey(&journey).await.unwrap();

    let fetched = repo.get_journey(JourneyId::new(1)).await.unwrap();
    assert_eq!(fetched, journey);

    let step = repo.get_step(StepId::new(12)).await.unwrap();
    assert_eq!(step.order(), 1);
    assert_eq!(step.points_awarded(), 15);

    // Replacing drops the old step rows.
    let base = Coordinate::new(48.8566, 2.3522).unwrap();
    let shorter = Journey::new(
        JourneyId::new(1),
        "River Walk (short)",
        vec![Step::new(StepId::new(21), JourneyId::new(1), 0, base, 40.0, 5).unwrap()],
    )
    .unwrap();
    repo.upsert_journey(&shorter).await.unwrap();

    assert!(matches!(
        repo.get_step(StepId::new(12)).await,
        Err(StorageError::NotFound)
    ));
    assert_eq!(repo.get_journey(JourneyId::new(1)).await.unwrap(), shorter);
    assert!(matches!(
        repo.get_journey(JourneyId::new(9)).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn sqlite_get_or_create_converges_on_first_record() {
    let repo = repo("memdb_get_or_create").await;
    let key = SessionKey::new(UserId::random(), JourneyId::new(1));

    let first = repo.get_or_create(key, 3, fixed_now()).await.unwrap();
    let second = repo
        .get_or_create(key, 3, fixed_now() + Duration::hours(2))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.created_at(), fixed_now());
    assert_eq!(second.version(), 0);
    assert!(second.is_active());
    assert!(repo.get_session(key).await.unwrap().is_some());

    let other = SessionKey::new(UserId::random(), JourneyId::new(1));
    assert!(repo.get_session(other).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_commit_is_conditional_and_completes_journey() {
    let repo = repo("memdb_commit").await;
    let journey = walk();
    let key = SessionKey::new(UserId::random(), journey.id());
    repo.get_or_create(key, journey.step_count(), fixed_now())
        .await
        .unwrap();

    let outcome = repo
        .commit_step_completion(&completion(key, &journey.steps()[0], 1), 0)
        .await
        .unwrap();
    let CommitOutcome::Committed(session) = outcome else {
        panic!("expected commit, got {outcome:?}");
    };
    assert_eq!(session.version(), 1);
    assert_eq!(session.total_points_earned(), 10);
    assert_eq!(session.current_step_index(), 1);
    assert_eq!(session.validation_history().len(), 1);

    let repeat = repo
        .commit_step_completion(&completion(key, &journey.steps()[0], 2), 1)
        .await
        .unwrap();
    assert!(matches!(repeat, CommitOutcome::AlreadyCompleted(_)));

    let stale = repo
        .commit_step_completion(&completion(key, &journey.steps()[2], 3), 0)
        .await
        .unwrap();
    assert_eq!(stale, CommitOutcome::VersionConflict);

    // Out of order is allowed; the cursor only moves forward.
    let CommitOutcome::Committed(session) = repo
        .commit_step_completion(&completion(key, &journey.steps()[2], 4), 1)
        .await
        .unwrap()
    else {
        panic!("expected commit");
    };
    assert_eq!(session.current_step_index(), 3);
    assert!(session.is_active());

    let CommitOutcome::Committed(done) = repo
        .commit_step_completion(&completion(key, &journey.steps()[1], 5), 2)
        .await
        .unwrap()
    else {
        panic!("expected commit");
    };
    assert!(!done.is_active());
    assert_eq!(done.total_points_earned(), 45);
    assert_eq!(done.completed_at(), Some(fixed_now() + Duration::minutes(5)));
    assert!(done.points_match(&journey));

    let after = repo
        .commit_step_completion(&completion(key, &journey.steps()[1], 6), 3)
        .await
        .unwrap();
    assert!(matches!(after, CommitOutcome::Inactive(_)));

    let stored = repo.get_session(key).await.unwrap().unwrap();
    assert_eq!(stored, done);
}

#[tokio::test]
async fn sqlite_touch_only_moves_forward() {
    let repo = repo("memdb_touch").await;
    let key = SessionKey::new(UserId::random(), JourneyId::new(1));
    repo.get_or_create(key, 3, fixed_now()).await.unwrap();

    let later = fixed_now() + Duration::minutes(10);
    repo.touch(key, later).await.unwrap();
    repo.touch(key, fixed_now() + Duration::minutes(1))
        .await
        .unwrap();

    let stored = repo.get_session(key).await.unwrap().unwrap();
    assert_eq!(stored.last_activity_at(), later);
    assert_eq!(stored.version(), 0);

    // Unknown sessions are ignored.
    let missing = SessionKey::new(UserId::random(), JourneyId::new(1));
    repo.touch(missing, later).await.unwrap();
    assert!(repo.get_session(missing).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_abandon_is_terminal() {
    let repo = repo("memdb_abandon").await;
    let journey = walk();
    let key = SessionKey::new(UserId::random(), journey.id());
    repo.get_or_create(key, journey.step_count(), fixed_now())
        .await
        .unwrap();

    let at = fixed_now() + Duration::minutes(3);
    let abandoned = repo.abandon(key, at).await.unwrap().unwrap();
    assert!(!abandoned.is_active());
    assert_eq!(abandoned.abandoned_at(), Some(at));
    assert_eq!(abandoned.version(), 1);

    // Second abandon is a no-op.
    let again = repo
        .abandon(key, at + Duration::minutes(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again, abandoned);

    let outcome = repo
        .commit_step_completion(&completion(key, &journey.steps()[0], 4), 1)
        .await
        .unwrap();
    assert!(matches!(outcome, CommitOutcome::Inactive(_)));

    let missing = SessionKey::new(UserId::random(), journey.id());
    assert!(repo.abandon(missing, at).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_validation_log_keeps_failures_and_locations() {
    let repo = repo("memdb_validation_log").await;
    let key = SessionKey::new(UserId::random(), JourneyId::new(1));
    let spot = Coordinate::new(48.857, 2.3522).unwrap();

    let first = repo
        .append(ValidationLogRecord {
            id: None,
            key,
            step_id: StepId::new(11),
            method: ValidationMethod::Geolocation,
            outcome: LogOutcome::TooFar,
            distance_meters: Some(44.5),
            location: Some(ReportedLocation::new(spot, Some(8.0))),
            attempted_at: fixed_now(),
        })
        .await
        .unwrap();
    let second = repo
        .append(ValidationLogRecord {
            id: None,
            key,
            step_id: StepId::new(11),
            method: ValidationMethod::Manual,
            outcome: LogOutcome::Completed,
            distance_meters: None,
            location: None,
            attempted_at: fixed_now() + Duration::seconds(30),
        })
        .await
        .unwrap();
    assert!(second > first);

    let entries = repo.entries_for_session(key).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, Some(first));
    assert_eq!(entries[0].outcome, LogOutcome::TooFar);
    assert!(!entries[0].success());
    let loc = entries[0].location.expect("location stored");
    assert!((loc.coordinate.latitude() - 48.857).abs() < 1e-9);
    assert_eq!(loc.accuracy_meters, Some(8.0));
    assert!(entries[1].success());
    assert!(entries[1].location.is_none());

    let other = SessionKey::new(UserId::random(), JourneyId::new(1));
    assert!(repo.entries_for_session(other).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_reads_never_see_half_a_commit() {
    let path = std::env::temp_dir().join(format!("journey-reads-{}.sqlite3", UserId::random()));
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let repo = SqliteRepository::connect(&url).await.unwrap();
    repo.migrate().await.unwrap();

    let journey = walk();
    let keys: Vec<SessionKey> = (0..20)
        .map(|_| SessionKey::new(UserId::random(), journey.id()))
        .collect();
    for key in &keys {
        repo.get_or_create(*key, journey.step_count(), fixed_now())
            .await
            .unwrap();
    }

    let writer = {
        let repo = repo.clone();
        let keys = keys.clone();
        let journey = journey.clone();
        tokio::spawn(async move {
            for key in keys {
                for (version, step) in (0_u64..).zip(journey.steps()) {
                    let outcome = repo
                        .commit_step_completion(&completion(key, step, 1), version)
                        .await
                        .unwrap();
                    assert!(matches!(outcome, CommitOutcome::Committed(_)));
                }
            }
        })
    };

    while !writer.is_finished() {
        for key in &keys {
            let session = repo.get_session(*key).await.unwrap().unwrap();
            assert_eq!(
                session.validation_history().len(),
                session.completed_steps().len()
            );
        }
    }
    writer.await.unwrap();

    for key in &keys {
        let session = repo.get_session(*key).await.unwrap().unwrap();
        assert_eq!(session.total_points_earned(), 45);
    }

    drop(repo);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}
