//! Suspending scopes: the same properties as the blocking suite, plus task
//! isolation and cancellation.

use std::future::Future;
use std::sync::Arc;
use std::task::Context;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::json;
use tokio::sync::{oneshot, Barrier};
use txscope::{
    AsyncConn, AsyncScopedEngine, Conn, Engine, ExecutionMode, MemoryConnection, MemoryEngine,
    ScopeError, ScopeResult, Statement,
};

type Db = AsyncScopedEngine<MemoryEngine>;

fn db() -> Db {
    txscope::init_test_tracing();
    let db = AsyncScopedEngine::new(MemoryEngine::new());
    db.engine().create_table("jobs").unwrap();
    db
}

fn insert() -> Statement {
    Statement::insert("jobs", json!({"state": "queued"}))
}

fn committed(db: &Db) -> usize {
    db.engine().committed_count("jobs").unwrap()
}

/// Let spawned cleanup tasks run to completion.
async fn settle_background(db: &Db) {
    for _ in 0..100 {
        let stats = db.engine().stats();
        if stats.connections_opened == stats.connections_closed {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("connections left open: {:?}", db.engine().stats());
}

// ===========================================================================
// Commit and rollback
// ===========================================================================

#[tokio::test]
async fn atomic_scope_commits_on_ok() {
    let db = db();

    db.atomic_scoped(|_| async {
        db.execute_strict_atomic(&insert()).await?;
        db.execute_strict_atomic(&insert()).await?;
        let seen = db.execute_strict_atomic(&Statement::count("jobs")).await?;
        assert_eq!(seen.scalar_u64(), Some(2));
        Ok::<_, ScopeError>(())
    })
    .await
    .unwrap();

    assert_eq!(committed(&db), 2);
    assert!(db.ambient().is_none());
}

#[tokio::test]
async fn atomic_scope_rolls_back_on_err() {
    let db = db();

    let err = db
        .atomic_scoped(|conn| async move {
            conn.execute(&insert()).await?;
            conn.execute(&insert()).await?;
            Err::<(), _>(anyhow!("worker crashed"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "worker crashed");
    assert_eq!(committed(&db), 0);
    assert_eq!(db.engine().stats().rollbacks, 1);
    assert!(db.ambient().is_none());
}

#[tokio::test]
async fn nested_atomic_scopes_collapse_to_one_transaction() {
    let db = &db();

    let (outer_id, inner_id) = db
        .atomic_scoped(|outer| async move {
            db.execute_strict_atomic(&insert()).await?;
            let inner_id = db
                .atomic_scoped(|inner| async move {
                    db.execute_strict_atomic(&insert()).await?;
                    Ok::<_, ScopeError>(inner.id())
                })
                .await?;
            assert_eq!(committed(db), 0);
            Ok::<_, ScopeError>((outer.id(), inner_id))
        })
        .await
        .unwrap();

    assert_eq!(outer_id, inner_id);
    assert_eq!(committed(db), 2);

    let stats = db.engine().stats();
    assert_eq!(stats.connections_opened, 1);
    assert_eq!(stats.begins, 1);
    assert_eq!(stats.commits, 1);
}

#[tokio::test]
async fn ambient_is_restored_after_nested_scope() {
    let db = &db();

    db.atomic_scoped(|a| async move {
        assert_eq!(db.ambient(), Some(a.clone()));
        db.connect_scoped(|b| async move {
            assert_eq!(b.mode(), ExecutionMode::Suspending);
            Ok::<_, ScopeError>(b)
        })
        .await
        .map(|b| assert_eq!(b, a))?;
        assert_eq!(db.ambient(), Some(a));
        Ok::<_, ScopeError>(())
    })
    .await
    .unwrap();

    assert!(db.ambient().is_none());
}

#[tokio::test]
async fn strict_atomic_outside_scope_fails_before_touching_the_database() {
    let db = db();
    let before = db.engine().stats();

    let err = db.execute_strict_atomic(&insert()).await.unwrap_err();
    assert!(matches!(err, ScopeError::NoAmbientAtomicContext));
    assert_eq!(db.engine().stats(), before);
}

#[tokio::test]
async fn strict_atomic_after_manual_rollback_fails() {
    let db = &db();

    db.atomic_scoped(|conn| async move {
        db.execute_strict_atomic(&insert()).await?;
        conn.rollback().await?;
        let err = db.execute_strict_atomic(&insert()).await.unwrap_err();
        assert!(matches!(err, ScopeError::NotInTransaction));
        Ok::<_, ScopeError>(())
    })
    .await
    .unwrap();

    assert_eq!(committed(db), 0);
    assert_eq!(db.engine().stats().commits, 0);
}

#[tokio::test]
async fn owned_connection_is_closed_when_the_scope_exits() {
    let db = db();

    let kept = db
        .atomic_scoped(|conn| async move { Ok::<_, ScopeError>(conn) })
        .await
        .unwrap();

    assert!(kept.with_connection(|conn| conn.is_closed()).await);
    assert!(kept.execute(&insert()).await.is_err());
}

// ===========================================================================
// One-statement calls
// ===========================================================================

#[tokio::test]
async fn execute_atomic_outside_scope_is_a_one_shot_transaction() {
    let db = db();
    db.execute_atomic(&insert()).await.unwrap();

    assert_eq!(committed(&db), 1);
    let stats = db.engine().stats();
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.connections_opened, stats.connections_closed);
}

#[tokio::test]
async fn execute_loose_without_scope_discards_writes() {
    let db = db();
    db.execute_loose(None, &insert()).await.unwrap();
    assert_eq!(committed(&db), 0);
}

#[tokio::test]
async fn strict_transactional_rejects_a_bare_connection() {
    let db = db();
    let conn = db.open_connection().await.unwrap();

    let err = db
        .execute_strict_transactional(Some(&conn), &insert())
        .await
        .unwrap_err();
    assert!(matches!(err, ScopeError::NotInTransaction));
    assert_eq!(db.engine().stats().begins, 0);
}

// ===========================================================================
// connect / transact
// ===========================================================================

#[tokio::test]
async fn transact_begins_on_a_bare_connection_and_keeps_it_open() {
    let db = db();
    let conn = db.open_connection().await.unwrap();

    db.transact(&conn, |given| async move {
        assert!(given.in_transaction().await);
        given.execute(&insert()).await?;
        Ok::<_, ScopeError>(())
    })
    .await
    .unwrap();

    assert!(!conn.in_transaction().await);
    assert_eq!(committed(&db), 1);
    assert_eq!(db.engine().stats().connections_closed, 0);
}

#[tokio::test]
async fn connect_with_connection_makes_it_ambient() {
    let db = &db();
    let conn = db.open_connection().await.unwrap();

    db.connect(&conn, |given| async move {
        assert_eq!(db.ambient(), Some(given));
        Ok::<_, ScopeError>(())
    })
    .await
    .unwrap();

    assert!(db.ambient().is_none());
}

#[tokio::test]
async fn blocking_handle_is_rejected_by_suspending_scopes() {
    let db = db();
    let blocking: Conn<MemoryConnection> = Conn::new(Engine::connect(db.engine()).unwrap());

    let err = db
        .connect(&blocking, |_| async { Ok::<_, ScopeError>(()) })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScopeError::CrossModeConnection {
            expected: ExecutionMode::Suspending,
            found: ExecutionMode::Blocking,
        }
    ));
}

// ===========================================================================
// Isolation across tasks
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_tasks_get_independent_scopes() {
    let db = db();
    let barrier = Arc::new(Barrier::new(2));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let (db, barrier) = (&db, &barrier);
                db.atomic_scoped(|conn| async move {
                    db.execute_strict_atomic(&insert()).await?;
                    barrier.wait().await;
                    assert_eq!(db.ambient(), Some(conn.clone()));
                    let seen = db
                        .execute_strict_atomic(&Statement::count("jobs"))
                        .await?
                        .scalar_u64();
                    barrier.wait().await;
                    Ok::<_, ScopeError>((conn.id(), seen))
                })
                .await
                .unwrap()
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert_ne!(results[0].0, results[1].0);
    assert_eq!(results[0].1, Some(1));
    assert_eq!(results[1].1, Some(1));
    assert_eq!(committed(&db), 2);
}

#[tokio::test]
async fn spawned_task_does_not_inherit_the_ambient_connection() {
    let db = db();

    db.atomic_scoped(|_| async {
        let child = db.clone();
        let seen = tokio::spawn(async move {
            let err = child.execute_strict_atomic(&insert()).await.unwrap_err();
            (child.ambient(), err)
        })
        .await
        .unwrap();
        assert!(seen.0.is_none());
        assert!(matches!(seen.1, ScopeError::NoAmbientAtomicContext));
        Ok::<_, ScopeError>(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn joined_scopes_in_one_task_stay_separate() {
    let db = db();

    let left = db.atomic_scoped(|conn| async move {
        tokio::task::yield_now().await;
        Ok::<_, ScopeError>(conn.id())
    });
    let right = db.atomic_scoped(|conn| async move {
        tokio::task::yield_now().await;
        Ok::<_, ScopeError>(conn.id())
    });
    let (left, right) = futures::join!(left, right);

    assert_ne!(left.unwrap(), right.unwrap());
    assert_eq!(db.engine().stats().commits, 2);
    assert!(db.ambient().is_none());
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn timeout_inside_scope_rolls_back_and_closes() {
    let db = db();

    let scope = db.atomic_scoped(|conn: AsyncConn<MemoryConnection>| async move {
        conn.execute(&insert()).await?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, ScopeError>(())
    });
    let elapsed = tokio::time::timeout(Duration::from_millis(10), scope).await;

    assert!(elapsed.is_err());
    assert!(db.ambient().is_none());
    assert_eq!(db.engine().stats().rollbacks, 1);

    settle_background(&db).await;
    assert_eq!(committed(&db), 0);
    assert_eq!(db.engine().stats().commits, 0);
}

#[tokio::test]
async fn aborted_task_rolls_back_its_scope() {
    let db = db();
    let (entered_tx, entered_rx) = oneshot::channel();

    let task = {
        let db = db.clone();
        tokio::spawn(async move {
            db.atomic_scoped(|conn| async move {
                conn.execute(&insert()).await?;
                let _ = entered_tx.send(());
                std::future::pending::<()>().await;
                Ok::<_, ScopeError>(())
            })
            .await
        })
    };

    entered_rx.await.unwrap();
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(db.engine().stats().rollbacks, 1);
    settle_background(&db).await;
    assert_eq!(committed(&db), 0);
}

#[tokio::test]
async fn scope_dropped_while_beginning_closes_its_connection() {
    let db = db();
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());

    let mut scope = Box::pin(db.atomic_scoped(|_| async { Ok::<_, ScopeError>(()) }));
    // first poll parks in connect, second in begin
    assert!(scope.as_mut().poll(&mut cx).is_pending());
    assert!(scope.as_mut().poll(&mut cx).is_pending());
    assert_eq!(db.engine().stats().connections_opened, 1);
    drop(scope);

    settle_background(&db).await;
    let stats = db.engine().stats();
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.commits, 0);
    assert!(db.ambient().is_none());
}

#[tokio::test]
async fn scope_dropped_mid_statement_rolls_back_and_closes() {
    let db = db();
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());

    let mut scope = Box::pin(db.atomic_scoped(|conn| async move {
        conn.execute(&insert()).await?;
        Ok::<_, ScopeError>(())
    }));
    // connect, begin, then the body's execute
    for _ in 0..3 {
        assert!(scope.as_mut().poll(&mut cx).is_pending());
    }
    assert_eq!(db.engine().stats().begins, 1);
    drop(scope);

    settle_background(&db).await;
    assert_eq!(committed(&db), 0);
    assert_eq!(db.engine().stats().commits, 0);
}

fn handler_bug() -> ScopeResult<()> {
    panic!("job handler bug")
}

#[tokio::test]
async fn panic_inside_scope_rolls_back() {
    let db = db();

    let task = {
        let db = db.clone();
        tokio::spawn(async move {
            db.atomic_scoped(|conn| async move {
                conn.execute(&insert()).await?;
                handler_bug()
            })
            .await
        })
    };

    assert!(task.await.unwrap_err().is_panic());
    assert_eq!(db.engine().stats().rollbacks, 1);
    settle_background(&db).await;
    assert_eq!(committed(&db), 0);
}

#[tokio::test]
async fn reuser_cancellation_leaves_the_outer_transaction_alone() {
    let db = &db();

    db.atomic_scoped(|conn| async move {
        let inner = db.atomic_scoped(|_| async {
            db.execute_strict_atomic(&insert()).await?;
            std::future::pending::<()>().await;
            Ok::<_, ScopeError>(())
        });
        let cancelled = tokio::time::timeout(Duration::from_millis(5), inner).await;
        assert!(cancelled.is_err());

        assert!(conn.in_transaction().await);
        assert_eq!(db.ambient(), Some(conn));
        db.execute_strict_atomic(&insert()).await?;
        Ok::<_, ScopeError>(())
    })
    .await
    .unwrap();

    assert_eq!(committed(db), 2);
    assert_eq!(db.engine().stats().rollbacks, 0);
}
