use std::sync::Arc;
use std::time::Duration;

use syncgroup::{BoolFuncs, Canceled, ErrFuncs, Status, TokenCalls};
use tokio_util::sync::CancellationToken;

use crate::{Counter, Gate, settle, setup, timeout};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
enum JobError {
    #[error("job failed: {0}")]
    Failed(usize),
    #[error("job canceled")]
    Canceled(#[from] Canceled),
}

#[tokio::test]
async fn test_chained_generations() {
    syncgroup_test::setup();

    let funcs = ErrFuncs::<JobError>::new();
    let gate = Gate::new();

    funcs.add(async { Ok(()) });
    let first_all_done = funcs.all_done();
    timeout(first_all_done.wait()).await;

    funcs.add({
        let gate = gate.clone();
        async move {
            gate.wait().await;
            Err(JobError::Failed(2))
        }
    });
    let all_done = funcs.all_done();
    settle().await;
    assert!(!all_done.is_fired());
    assert!(first_all_done.is_fired());

    gate.open();
    timeout(all_done.wait()).await;
    assert_eq!(
        timeout(funcs.first_error().wait()).await,
        Err(JobError::Failed(2))
    );
    // the earliest result is still the first one
    assert_eq!(funcs.first_done().get(), Some(Ok(())));
}

#[tokio::test]
async fn test_many_generations() {
    syncgroup_test::setup();

    let funcs = BoolFuncs::new();
    let finished = Counter::new();
    let gates: Vec<_> = (0..5).map(|_| Gate::new()).collect();

    let mut signals = Vec::new();
    for gate in &gates {
        let gate = gate.clone();
        let finished = finished.clone();
        funcs.add(async move {
            gate.wait().await;
            finished.bump();
            false
        });
        signals.push(funcs.all_done());
    }

    // Completing a later generation first does not fire anything.
    gates[4].open();
    settle().await;
    assert!(signals.iter().all(|signal| !signal.is_fired()));

    for gate in &gates[..4] {
        gate.open();
    }
    for signal in &signals {
        timeout(signal.wait()).await;
    }
    assert_eq!(finished.get(), 5);
    assert!(!funcs.first_ok().is_fired());
    assert_eq!(funcs.first_error().get(), Some(false));
}

#[tokio::test]
async fn test_canceled_jobs_are_ignored() {
    syncgroup_test::setup();

    let funcs = ErrFuncs::new();
    let token = CancellationToken::new();
    funcs.set_cancel(Some(token.clone()));

    for i in 0..3 {
        let token = token.clone();
        funcs.add(async move {
            tokio::select! {
                () = token.cancelled() => Err(JobError::Canceled(Canceled)),
                () = tokio::time::sleep(Duration::from_secs(60)) => Err(JobError::Failed(i)),
            }
        });
    }
    let all_done = funcs.all_done();
    token.cancel();

    timeout(all_done.wait()).await;
    assert!(!funcs.first_done().is_fired());
    assert!(!funcs.first_error().is_fired());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fan_in_over_coalesced_calls() {
    let calls = setup(TokenCalls::<_, (), JobError>::new());
    let executed = Counter::new();
    let gate = Gate::new();
    let token = CancellationToken::new();

    let funcs = ErrFuncs::<JobError>::new();
    funcs.set_monitor({
        let executed = executed.clone();
        move |_result: &Result<(), JobError>| {
            executed.bump();
        }
    });
    funcs.extend((0..4).map(|i| {
        let calls = Arc::clone(&calls);
        let gate = gate.clone();
        let token = token.clone();
        async move {
            let (result, status) = calls
                .run(&token, "shared", || async move {
                    gate.wait().await;
                    Err(JobError::Failed(i))
                })
                .await;
            assert_eq!(status, Status::Shared);
            result
        }
    }));
    let first_error = funcs.first_error();
    settle().await;
    gate.open();

    let error = timeout(first_error.wait()).await;
    assert!(matches!(error, Err(JobError::Failed(i)) if i < 4));
    timeout(funcs.all_done().wait()).await;
    // every job reports the same shared error
    assert_eq!(executed.get(), 4);
    assert!(!funcs.first_ok().is_fired());
}
