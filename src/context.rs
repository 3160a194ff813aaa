//! Call-scoped context slot
//!
//! Every traced call opens a fresh slot for the duration of the call: a
//! `sync_scope` for synchronous calls and a task-local `scope` around the
//! future for asynchronous ones. Code running inside the call attaches data
//! with [`set_context`]; the tracker takes it when the call finishes. Nested
//! calls shadow the outer slot and concurrent calls (other threads, other
//! tasks) never share one.

use crate::trace::TraceContext;
use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<Option<TraceContext>>;
}

/// Attach context to the innermost traced call on this task or thread
///
/// Returns `false` (and drops the context) when no traced call is active.
/// A second call within the same traced call replaces the first.
pub fn set_context(context: TraceContext) -> bool {
    let attached = CURRENT_CONTEXT
        .try_with(|slot| {
            *slot.borrow_mut() = Some(context);
        })
        .is_ok();
    if !attached {
        tracing::debug!("set_context called outside a traced call; context dropped");
    }
    attached
}

/// Context set so far in the current traced call
pub fn get_context() -> Option<TraceContext> {
    CURRENT_CONTEXT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Discard context set so far in the current traced call
pub fn clear_context() {
    let _ = CURRENT_CONTEXT.try_with(|slot| slot.borrow_mut().take());
}

/// Whether a traced call is active on this task or thread
pub fn in_traced_call() -> bool {
    CURRENT_CONTEXT.try_with(|_| ()).is_ok()
}

fn take_context() -> Option<TraceContext> {
    CURRENT_CONTEXT
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

/// Run `f` in a fresh slot and return what it left behind
pub(crate) fn run_scoped<R>(f: impl FnOnce() -> R) -> (R, Option<TraceContext>) {
    CURRENT_CONTEXT.sync_scope(RefCell::new(None), || {
        let out = f();
        (out, take_context())
    })
}

/// Await `fut` in a fresh slot and return what it left behind
pub(crate) async fn run_scoped_async<F: Future>(fut: F) -> (F::Output, Option<TraceContext>) {
    CURRENT_CONTEXT
        .scope(RefCell::new(None), async move {
            let out = fut.await;
            (out, take_context())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(n: i64) -> TraceContext {
        TraceContext::default().with_entry("n", json!(n))
    }

    #[test]
    fn test_set_outside_scope_is_dropped() {
        assert!(!in_traced_call());
        assert!(!set_context(ctx(1)));
        assert!(get_context().is_none());
    }

    #[test]
    fn test_scope_collects_and_clears() {
        let ((), collected) = run_scoped(|| {
            assert!(set_context(ctx(1)));
            assert_eq!(get_context(), Some(ctx(1)));
        });
        assert_eq!(collected, Some(ctx(1)));

        let ((), collected) = run_scoped(|| {});
        assert!(collected.is_none());
    }

    #[test]
    fn test_nested_scopes_do_not_leak() {
        let (inner, outer) = run_scoped(|| {
            set_context(ctx(1));
            let ((), inner) = run_scoped(|| {
                assert!(get_context().is_none());
                set_context(ctx(2));
            });
            assert_eq!(get_context(), Some(ctx(1)));
            inner
        });
        assert_eq!(inner, Some(ctx(2)));
        assert_eq!(outer, Some(ctx(1)));
    }

    #[test]
    fn test_clear_context() {
        let ((), collected) = run_scoped(|| {
            set_context(ctx(3));
            clear_context();
        });
        assert!(collected.is_none());
    }

    #[tokio::test]
    async fn test_async_scope_survives_await_points() {
        let ((), collected) = run_scoped_async(async {
            set_context(ctx(4));
            tokio::task::yield_now().await;
        })
        .await;
        assert_eq!(collected, Some(ctx(4)));
    }

    #[tokio::test]
    async fn test_concurrent_tasks_are_isolated() {
        let a = tokio::spawn(run_scoped_async(async {
            set_context(ctx(10));
            tokio::task::yield_now().await;
            get_context()
        }));
        let b = tokio::spawn(run_scoped_async(async {
            tokio::task::yield_now().await;
            get_context()
        }));

        let (seen_a, collected_a) = a.await.unwrap();
        let (seen_b, collected_b) = b.await.unwrap();
        assert_eq!(seen_a, Some(ctx(10)));
        assert_eq!(collected_a, Some(ctx(10)));
        assert!(seen_b.is_none());
        assert!(collected_b.is_none());
    }
}
