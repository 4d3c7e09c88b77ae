//! Middleware composition.
//!
//! A middleware receives the message and a [`Next`] handle; awaiting
//! `next.run(event)` runs the rest of the chain. Not calling it stops the
//! chain. Calling it twice from the same stage is rejected with
//! [`NextCalledTwice`] and the downstream stages do not run again.
//!
//! [`compose`] folds a list of middlewares into a [`Composed`] pipeline that
//! is itself a [`Middleware`], so pipelines nest. It also implements
//! [`tower::Service`], which is how the host drives a context's chain.
//!
//! ```rust,ignore
//! let pipeline = compose(vec![
//!     Arc::new(|event: Arc<MessageEvent>, next: Next| async move {
//!         tracing::debug!(text = %event.text, "before");
//!         next.run(event).await
//!     }) as Arc<dyn Middleware>,
//!     Arc::new(ReplyToPing),
//! ]);
//! pipeline.oneshot(event).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use kiln_core::MessageEvent;
use parking_lot::Mutex;
use tower::Service;

use crate::error::{BoxError, NextCalledTwice};

/// The future returned by a middleware.
pub type MiddlewareFuture = BoxFuture<'static, Result<(), BoxError>>;

/// A stage of a message pipeline.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, event: Arc<MessageEvent>, next: Next) -> MiddlewareFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Arc<MessageEvent>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn handle(&self, event: Arc<MessageEvent>, next: Next) -> MiddlewareFuture {
        self(event, next).boxed()
    }
}

// ============================================================================
// Chain state
// ============================================================================

/// State of one run of a composed pipeline.
struct Chain {
    stages: Arc<[Arc<dyn Middleware>]>,
    /// Continuation after the last stage, when this pipeline is nested.
    tail: Option<Next>,
    /// Highest stage index dispatched so far.
    reached: Mutex<Option<usize>>,
}

impl Chain {
    fn dispatch(self: Arc<Self>, index: usize, event: Arc<MessageEvent>) -> MiddlewareFuture {
        {
            let mut reached = self.reached.lock();
            if reached.is_some_and(|r| index <= r) {
                return future::ready(Err(NextCalledTwice.into())).boxed();
            }
            *reached = Some(index);
        }

        let stage = self.stages.get(index).cloned();
        match stage {
            Some(stage) => {
                let next = Next {
                    chain: self,
                    position: index + 1,
                };
                stage.handle(event, next)
            }
            None => match &self.tail {
                Some(tail) => tail.run(event),
                None => future::ready(Ok(())).boxed(),
            },
        }
    }
}

/// Handle to the remainder of a pipeline.
#[derive(Clone)]
pub struct Next {
    chain: Arc<Chain>,
    position: usize,
}

impl Next {
    /// Runs the remaining stages.
    pub fn run(&self, event: Arc<MessageEvent>) -> MiddlewareFuture {
        self.chain.clone().dispatch(self.position, event)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("position", &self.position)
            .field("stages", &self.chain.stages.len())
            .finish()
    }
}

// ============================================================================
// Composition
// ============================================================================

/// A pipeline built by [`compose`].
#[derive(Clone)]
pub struct Composed {
    stages: Arc<[Arc<dyn Middleware>]>,
}

/// Folds `stages` into one pipeline that runs them in order.
pub fn compose(stages: Vec<Arc<dyn Middleware>>) -> Composed {
    Composed {
        stages: stages.into(),
    }
}

impl Composed {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the pipeline; `tail` runs after the last stage calls `next`.
    pub fn run(&self, event: Arc<MessageEvent>, tail: Option<Next>) -> MiddlewareFuture {
        let chain = Arc::new(Chain {
            stages: self.stages.clone(),
            tail,
            reached: Mutex::new(None),
        });
        chain.dispatch(0, event)
    }
}

impl Middleware for Composed {
    fn handle(&self, event: Arc<MessageEvent>, next: Next) -> MiddlewareFuture {
        self.run(event, Some(next))
    }
}

impl Service<Arc<MessageEvent>> for Composed {
    type Response = ();
    type Error = BoxError;
    type Future = MiddlewareFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<MessageEvent>) -> Self::Future {
        self.run(event, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    type Log = Arc<Mutex<Vec<String>>>;

    fn event() -> Arc<MessageEvent> {
        Arc::new(MessageEvent::private("1", "hi"))
    }

    /// A stage that records `label` on the way in and out.
    fn tracer(log: &Log, label: &'static str) -> Arc<dyn Middleware> {
        let log = log.clone();
        Arc::new(move |event: Arc<MessageEvent>, next: Next| {
            let log = log.clone();
            async move {
                log.lock().push(format!("{label}>"));
                next.run(event).await?;
                log.lock().push(format!("<{label}"));
                Ok::<(), BoxError>(())
            }
        })
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let log = Log::default();
        let pipeline = compose(vec![tracer(&log, "a"), tracer(&log, "b")]);
        pipeline.oneshot(event()).await.unwrap();
        assert_eq!(*log.lock(), vec!["a>", "b>", "<b", "<a"]);
    }

    #[tokio::test]
    async fn test_stage_can_stop_chain() {
        let log = Log::default();
        let stop: Arc<dyn Middleware> =
            Arc::new(|_event: Arc<MessageEvent>, _next: Next| async { Ok::<(), BoxError>(()) });
        let pipeline = compose(vec![tracer(&log, "a"), stop, tracer(&log, "c")]);
        pipeline.run(event(), None).await.unwrap();
        assert_eq!(*log.lock(), vec!["a>", "<a"]);
    }

    #[tokio::test]
    async fn test_next_twice_is_rejected() {
        let log = Log::default();
        let twice: Arc<dyn Middleware> = Arc::new(|event: Arc<MessageEvent>, next: Next| async move {
            next.run(event.clone()).await?;
            next.run(event).await
        });
        let pipeline = compose(vec![twice, tracer(&log, "b")]);

        let err = pipeline.run(event(), None).await.unwrap_err();
        assert!(err.is::<NextCalledTwice>());
        assert_eq!(err.to_string(), "next() called multiple times");
        assert_eq!(*log.lock(), vec!["b>", "<b"]);
    }

    #[tokio::test]
    async fn test_composition_is_associative() {
        let log_flat = Log::default();
        let flat = compose(vec![
            tracer(&log_flat, "a"),
            tracer(&log_flat, "b"),
            tracer(&log_flat, "c"),
        ]);
        flat.run(event(), None).await.unwrap();

        let log_left = Log::default();
        let left = compose(vec![
            Arc::new(compose(vec![tracer(&log_left, "a"), tracer(&log_left, "b")]))
                as Arc<dyn Middleware>,
            tracer(&log_left, "c"),
        ]);
        left.run(event(), None).await.unwrap();

        let log_right = Log::default();
        let right = compose(vec![
            tracer(&log_right, "a"),
            Arc::new(compose(vec![tracer(&log_right, "b"), tracer(&log_right, "c")]))
                as Arc<dyn Middleware>,
        ]);
        right.run(event(), None).await.unwrap();

        assert_eq!(*log_flat.lock(), *log_left.lock());
        assert_eq!(*log_flat.lock(), *log_right.lock());
    }

    #[tokio::test]
    async fn test_error_propagates_to_caller() {
        let failing: Arc<dyn Middleware> =
            Arc::new(|_event: Arc<MessageEvent>, _next: Next| async { Err::<(), BoxError>("nope".into()) });
        let pipeline = compose(vec![failing]);
        assert!(pipeline.run(event(), None).await.is_err());
    }

    #[test]
    fn test_empty_pipeline_is_ready() {
        let pipeline = compose(Vec::new());
        assert!(pipeline.is_empty());
        tokio_test::assert_ready_ok!(tokio_test::task::spawn(pipeline.run(event(), None)).poll());
    }
}
