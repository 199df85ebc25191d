//! Job store contract, exercised against the in-memory backend.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use searchq::error::Error;
use searchq::model::{Job, JobId, JobState, Transition};
use searchq::store::{JobStore, MemoryJobStore};
use serde_json::json;

fn claim(worker: &str) -> Transition {
    Transition::Claim {
        worker_id: worker.to_string(),
        retry_ceiling: 3,
    }
}

#[tokio::test]
async fn create_starts_pending_at_version_zero() {
    let store = MemoryJobStore::new();
    let job = store.create(json!({"query": "rust"})).await.unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.version, 0);
    assert_eq!(job.attempts, 0);
    assert_eq!(store.get(job.id).await.unwrap(), job);
}

#[tokio::test]
async fn get_unknown_is_not_found() {
    let store = MemoryJobStore::new();
    let id = JobId::new();
    assert!(matches!(store.get(id).await, Err(Error::NotFound(missing)) if missing == id));
}

#[tokio::test]
async fn stale_version_is_rejected_without_writing() {
    let store = MemoryJobStore::new();
    let job = store.create(json!({})).await.unwrap();
    store.compare_and_update(job.id, 0, claim("w1")).await.unwrap();

    let err = store
        .compare_and_update(job.id, 0, Transition::Cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VersionConflict { expected: 0, .. }));

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Claimed);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn illegal_transition_leaves_record_untouched() {
    let store = MemoryJobStore::new();
    let job = store.create(json!({})).await.unwrap();

    let err = store
        .compare_and_update(job.id, 0, Transition::Succeed { result: json!(1) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IllegalTransition { from: JobState::Pending, event: "succeed", .. }));
    assert_eq!(store.get(job.id).await.unwrap(), job);
}

#[tokio::test]
async fn terminal_jobs_accept_no_further_updates() {
    let store = MemoryJobStore::new();
    let job = store.create(json!({})).await.unwrap();
    let claimed = store.compare_and_update(job.id, 0, claim("w1")).await.unwrap();
    let running = store
        .compare_and_update(
            job.id,
            claimed.version,
            Transition::Start {
                worker_id: "w1".to_string(),
            },
        )
        .await
        .unwrap();
    let done = store
        .compare_and_update(job.id, running.version, Transition::Succeed { result: json!("ok") })
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Completed);

    for t in [claim("w2"), Transition::Cancel, Transition::Reclaim { retry_ceiling: 3 }] {
        let err = store
            .compare_and_update(job.id, done.version, t)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { from: JobState::Completed, .. }));
    }
    assert_eq!(store.get(job.id).await.unwrap().version, done.version);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store.create(json!({})).await.unwrap();

    let id = job.id;
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .compare_and_update(id, 0, claim(&format!("w{i}")))
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(Error::VersionConflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 15);

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn list_by_state_is_oldest_update_first() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let mut ids = Vec::new();
    for age_minutes in [5, 30, 10] {
        let mut job = Job::new(json!({}));
        job.updated_at = now - ChronoDuration::minutes(age_minutes);
        ids.push(job.id);
        store.put_raw(job);
    }
    store.create(json!({})).await.unwrap();

    let listed: Vec<JobId> = store
        .list_by_state(JobState::Pending)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(listed.len(), 4);
    assert_eq!(&listed[..3], &[ids[1], ids[2], ids[0]]);
    assert!(store.list_by_state(JobState::Running).await.unwrap().is_empty());
}

#[tokio::test]
async fn unavailable_store_reports_transient_errors() {
    let store = MemoryJobStore::new();
    let job = store.create(json!({})).await.unwrap();
    store.set_available(false);

    let err = store.get(job.id).await.unwrap_err();
    assert!(err.is_transient());
    assert!(store.health_check().await.is_err());

    store.set_available(true);
    assert!(store.health_check().await.is_ok());
    assert_eq!(store.get(job.id).await.unwrap(), job);
}
