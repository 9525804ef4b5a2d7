//! Behavioural tests for the composite transactor over in-memory doubles.

use std::time::Duration;

use coordinator::domain::ports::{Transaction, TransactionError, Transactor};
use coordinator::domain::{CompositeTransactor, Context};
use coordinator::test_support::recording::{CallCounts, RecordingTransactor};
use rstest::rstest;

fn composite(children: &[RecordingTransactor]) -> CompositeTransactor {
    children
        .iter()
        .fold(CompositeTransactor::builder(), |builder, child| {
            builder.with(child.clone())
        })
        .build()
}

#[rstest]
#[tokio::test]
async fn begin_ctx_attaches_every_child() {
    let children = [RecordingTransactor::new("a"), RecordingTransactor::new("b")];
    let transactor = composite(&children);

    let ctx = transactor
        .begin_ctx(&Context::background())
        .await
        .expect("begin succeeds");

    let composite_ctx = ctx.as_composite().expect("composite context");
    assert_eq!(composite_ctx.len(), 2);
    for child in &children {
        assert!(ctx.active_transaction(&child.key()).is_some());
    }
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[tokio::test]
async fn begin_ctx_fails_when_any_child_fails(#[case] failing: usize) {
    let children: Vec<_> = (0..3)
        .map(|index| {
            let child = RecordingTransactor::new("child");
            if index == failing {
                child.failing_begin()
            } else {
                child
            }
        })
        .collect();
    let transactor = composite(&children);

    let result = transactor.begin_ctx(&Context::background()).await;

    assert_eq!(
        result.err(),
        Some(TransactionError::begin("child", "injected failure"))
    );
    for child in &children {
        assert_eq!(child.counts().begin, 1);
        assert_eq!(child.counts().commit + child.counts().rollback, 0);
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn begin_reports_lowest_index_failure() {
    let slow = RecordingTransactor::new("slow")
        .failing_begin()
        .with_begin_delay(Duration::from_millis(50));
    let fast = RecordingTransactor::new("fast").failing_begin();
    let transactor = composite(&[slow, fast]);

    let result = transactor.begin_ctx(&Context::background()).await;

    assert_eq!(
        result.err(),
        Some(TransactionError::begin("slow", "injected failure"))
    );
}

const CHILD_DELAY: Duration = Duration::from_millis(100);

fn assert_overlapped(elapsed: Duration) {
    assert!(
        elapsed >= CHILD_DELAY && elapsed < CHILD_DELAY * 2,
        "children ran one after another: {elapsed:?}"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn begin_ctx_runs_children_concurrently() {
    let children = [
        RecordingTransactor::new("a").with_begin_delay(CHILD_DELAY),
        RecordingTransactor::new("b").with_begin_delay(CHILD_DELAY),
    ];
    let transactor = composite(&children);
    let started = tokio::time::Instant::now();

    transactor
        .begin_ctx(&Context::background())
        .await
        .expect("begin succeeds");

    assert_overlapped(started.elapsed());
}

#[rstest]
#[case::commit(true)]
#[case::rollback(false)]
#[tokio::test(start_paused = true)]
async fn finalize_runs_children_concurrently(#[case] commit: bool) {
    let children = [
        RecordingTransactor::new("a").with_finalize_delay(CHILD_DELAY),
        RecordingTransactor::new("b").with_finalize_delay(CHILD_DELAY),
    ];
    let transactor = composite(&children);
    let ctx = transactor
        .begin_ctx(&Context::background())
        .await
        .expect("begin succeeds");
    let started = tokio::time::Instant::now();

    let result = if commit {
        transactor.commit_ctx(&ctx).await
    } else {
        transactor.rollback_ctx(&ctx).await
    };

    assert_eq!(result, Ok(()));
    assert_overlapped(started.elapsed());
}

#[rstest]
#[tokio::test]
async fn commit_reaches_every_child_despite_failures() {
    let children = [
        RecordingTransactor::new("a").failing_commit(),
        RecordingTransactor::new("b"),
        RecordingTransactor::new("c").failing_commit(),
    ];
    let transactor = composite(&children);
    let ctx = transactor
        .begin_ctx(&Context::background())
        .await
        .expect("begin succeeds");

    let error = transactor
        .commit_ctx(&ctx)
        .await
        .expect_err("two children fail");

    let failed: Vec<_> = error
        .backend_errors()
        .into_iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        failed,
        vec![
            "a: failed to commit transaction: injected failure",
            "c: failed to commit transaction: injected failure",
        ]
    );
    for child in &children {
        assert_eq!(
            child.counts(),
            CallCounts {
                begin: 1,
                commit: 1,
                rollback: 0
            }
        );
    }
}

#[rstest]
#[tokio::test]
async fn single_failure_is_not_wrapped() {
    let children = [
        RecordingTransactor::new("a"),
        RecordingTransactor::new("b").failing_rollback(),
    ];
    let transactor = composite(&children);
    let ctx = transactor
        .begin_ctx(&Context::background())
        .await
        .expect("begin succeeds");

    let result = transactor.rollback_ctx(&ctx).await;

    assert_eq!(
        result,
        Err(TransactionError::rollback("b", "injected failure"))
    );
}

#[rstest]
#[tokio::test]
async fn finalizing_a_context_without_handles_is_a_no_op() {
    let children = [RecordingTransactor::new("a"), RecordingTransactor::new("b")];
    let transactor = composite(&children);

    transactor
        .commit_ctx(&Context::background())
        .await
        .expect("nothing to commit");
    transactor
        .rollback_ctx(&Context::background())
        .await
        .expect("nothing to roll back");

    for child in &children {
        assert_eq!(child.counts(), CallCounts::default());
    }
}

#[rstest]
#[tokio::test]
async fn second_commit_reports_already_finalized() {
    let child = RecordingTransactor::new("a");
    let transactor = composite(std::slice::from_ref(&child));
    let ctx = transactor
        .begin_ctx(&Context::background())
        .await
        .expect("begin succeeds");

    transactor.commit_ctx(&ctx).await.expect("first commit");
    let second = transactor.commit_ctx(&ctx).await;

    assert_eq!(second, Err(TransactionError::already_finalized("a")));
}

#[rstest]
#[tokio::test]
async fn composite_transaction_handle_finalizes_children() {
    let children = [RecordingTransactor::new("a"), RecordingTransactor::new("b")];
    let transactor = composite(&children);

    let transaction = transactor
        .begin(&Context::background())
        .await
        .expect("begin succeeds");
    assert!(!transaction.is_finalized());

    transaction.rollback().await.expect("rollback succeeds");

    assert!(transaction.is_finalized());
    for child in &children {
        assert_eq!(child.counts().rollback, 1);
    }
    let ctx = transaction.context();
    assert!(ctx.active_transaction(&children[0].key()).is_some());
}

#[rstest]
#[tokio::test]
async fn nested_composites_fan_out_recursively() {
    let leaves = [
        RecordingTransactor::new("a"),
        RecordingTransactor::new("b"),
        RecordingTransactor::new("c"),
    ];
    let inner = composite(&leaves[1..]);
    let outer = CompositeTransactor::builder()
        .with(leaves[0].clone())
        .with(inner)
        .build();

    let ctx = outer
        .begin_ctx(&Context::background())
        .await
        .expect("begin succeeds");
    outer.commit_ctx(&ctx).await.expect("commit succeeds");

    for leaf in &leaves {
        assert_eq!(leaf.counts().commit, 1);
    }
}
