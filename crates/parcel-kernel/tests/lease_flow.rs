use std::sync::{Arc, Barrier};

use parcel_core::{ByteRange, ReleaseOutcome, TokenState};
use parcel_kernel::{AcquireOutcome, Kernel, Lease, ReleaseResult};
use tempfile::tempdir;

fn acquired(outcome: AcquireOutcome) -> Lease {
    match outcome {
        AcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected a lease, got {other:?}"),
    }
}

fn range(start: u64, end: u64) -> ByteRange {
    ByteRange::new(start, end).expect("valid range")
}

#[test]
fn concurrent_acquire_grants_a_single_lease() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel.issue_token("race", "buyer", "asset.bin").unwrap();

    let contenders = 16;
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let kernel = kernel.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                kernel.try_acquire("race").expect("acquire attempt")
            })
        })
        .collect();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread join"))
        .collect();
    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, AcquireOutcome::Acquired(_)))
        .count();
    assert_eq!(winners, 1, "exactly one contender should hold the lease");
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, AcquireOutcome::Acquired(_) | AcquireOutcome::Locked)));

    let row = kernel.get_token("race").unwrap().unwrap();
    assert_eq!(row.state, TokenState::Locked);
}

#[test]
fn failed_acquire_reports_reason_without_mutation() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    assert_eq!(kernel.try_acquire("nope").unwrap(), AcquireOutcome::NotFound);

    kernel.issue_token("t", "buyer", "asset.bin").unwrap();
    let lease = acquired(kernel.try_acquire("t").unwrap());
    let before = kernel.get_token("t").unwrap().unwrap();
    assert_eq!(kernel.try_acquire("t").unwrap(), AcquireOutcome::Locked);
    let after = kernel.get_token("t").unwrap().unwrap();
    assert_eq!(before, after);

    kernel
        .record_coverage(&lease.token, &lease.lease_id, Some(range(0, 9)))
        .unwrap();
    assert_eq!(
        kernel
            .release(&lease.token, &lease.lease_id, ReleaseOutcome::Completed)
            .unwrap(),
        ReleaseResult::Released
    );
    assert_eq!(
        kernel.try_acquire("t").unwrap(),
        AcquireOutcome::AlreadyCompleted
    );
}

#[test]
fn paused_token_can_be_resumed() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel.issue_token("t", "buyer", "asset.bin").unwrap();

    let first = acquired(kernel.try_acquire("t").unwrap());
    kernel
        .record_coverage("t", &first.lease_id, Some(range(0, 499)))
        .unwrap();
    kernel
        .release("t", &first.lease_id, ReleaseOutcome::Paused)
        .unwrap();

    let second = acquired(kernel.try_acquire("t").unwrap());
    assert_ne!(first.lease_id, second.lease_id);
    let merged = kernel
        .record_coverage("t", &second.lease_id, Some(range(500, 999)))
        .unwrap()
        .expect("lease is current");
    assert!(merged.is_fully_covered(1000));
}

#[test]
fn stale_lease_cannot_write_or_release() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel.issue_token("t", "buyer", "asset.bin").unwrap();

    let old = acquired(kernel.try_acquire("t").unwrap());
    kernel.release("t", &old.lease_id, ReleaseOutcome::Paused).unwrap();
    let current = acquired(kernel.try_acquire("t").unwrap());

    assert_eq!(
        kernel
            .record_coverage("t", &old.lease_id, Some(range(0, 9)))
            .unwrap(),
        None
    );
    assert_eq!(
        kernel
            .release("t", &old.lease_id, ReleaseOutcome::Completed)
            .unwrap(),
        ReleaseResult::Stale
    );
    let row = kernel.get_token("t").unwrap().unwrap();
    assert_eq!(row.state, TokenState::Locked);
    assert_eq!(row.lease_id.as_deref(), Some(current.lease_id.as_str()));
    assert!(row.coverage.is_empty());
}

#[test]
fn racing_completions_resolve_once_and_notify_once() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel.issue_token("t", "buyer", "asset.bin").unwrap();
    let lease = acquired(kernel.try_acquire("t").unwrap());
    kernel
        .record_coverage("t", &lease.lease_id, Some(range(0, 999)))
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let kernel = kernel.clone();
            let barrier = barrier.clone();
            let lease_id = lease.lease_id.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let result = kernel
                    .release("t", &lease_id, ReleaseOutcome::Completed)
                    .expect("release");
                let claimed = kernel.claim_notification("t").expect("claim");
                (result, claimed)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let released = results
        .iter()
        .filter(|(r, _)| *r == ReleaseResult::Released)
        .count();
    let claims = results.iter().filter(|(_, c)| *c).count();
    assert_eq!(released, 1);
    assert_eq!(claims, 1);
    assert!(results
        .iter()
        .any(|(r, _)| *r == ReleaseResult::AlreadyCompleted));

    let row = kernel.get_token("t").unwrap().unwrap();
    assert_eq!(row.state, TokenState::Completed);
    assert!(row.completed_at.is_some());
    assert!(row.notified_at.is_some());
    assert!(row.lease_id.is_none());
}

#[test]
fn notification_claim_requires_completion() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel.issue_token("t", "buyer", "asset.bin").unwrap();
    assert!(!kernel.claim_notification("t").unwrap());
    assert!(!kernel.claim_notification("missing").unwrap());
}

#[test]
fn completed_record_ignores_later_pause() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel.issue_token("t", "buyer", "asset.bin").unwrap();
    let lease = acquired(kernel.try_acquire("t").unwrap());
    kernel
        .release("t", &lease.lease_id, ReleaseOutcome::Completed)
        .unwrap();
    let before = kernel.get_token("t").unwrap().unwrap();

    assert_eq!(
        kernel
            .release("t", &lease.lease_id, ReleaseOutcome::Paused)
            .unwrap(),
        ReleaseResult::AlreadyCompleted
    );
    assert_eq!(
        kernel
            .record_coverage("t", &lease.lease_id, Some(range(0, 9)))
            .unwrap(),
        None
    );
    assert_eq!(kernel.get_token("t").unwrap().unwrap(), before);
}

#[test]
fn startup_recovery_unlocks_stranded_tokens() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel.issue_token("a", "buyer", "asset.bin").unwrap();
    kernel.issue_token("b", "buyer", "asset.bin").unwrap();
    acquired(kernel.try_acquire("a").unwrap());

    assert_eq!(kernel.recover_stale_leases().unwrap(), 1);
    let a = kernel.get_token("a").unwrap().unwrap();
    assert_eq!(a.state, TokenState::Paused);
    assert!(a.lease_id.is_none());
    assert_eq!(
        kernel.get_token("b").unwrap().unwrap().state,
        TokenState::Issued
    );
    acquired(kernel.try_acquire("a").unwrap());
}

#[tokio::test]
async fn async_wrappers_share_the_same_store() {
    let dir = tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    kernel
        .issue_token_async("t", "buyer", "asset.bin")
        .await
        .unwrap();
    let lease = acquired(kernel.try_acquire_async("t").await.unwrap());
    let coverage = kernel
        .record_coverage_async("t", &lease.lease_id, Some(range(0, 4)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(coverage.total_covered(), 5);
    assert_eq!(
        kernel
            .release_async("t", &lease.lease_id, ReleaseOutcome::Paused)
            .await
            .unwrap(),
        ReleaseResult::Released
    );
    let row = kernel.get_token_async("t").await.unwrap().unwrap();
    assert_eq!(row.state, TokenState::Paused);
    assert_eq!(kernel.recover_stale_leases_async().await.unwrap(), 0);
}
