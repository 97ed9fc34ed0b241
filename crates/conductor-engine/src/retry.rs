//! Opt-in retry for node actions.
//!
//! The executor itself never retries: a failed node fails the run. Node
//! authors who know their work is flaky (network calls, slow subprocesses)
//! wrap the action with [`Retrying`] or call [`Node::retry`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conductor_types::{ConductorError, GraphState, Result};

use crate::node::{Node, NodeAction, NodeContext};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self { max_retries, backoff }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, BackoffPolicy::default())
    }
}

/// Wraps an action and re-runs it on errors where
/// [`ConductorError::is_retryable`] holds. Each attempt starts from a fresh
/// clone of the input state.
pub struct Retrying<S> {
    inner: Arc<dyn NodeAction<S>>,
    policy: RetryPolicy,
}

impl<S: GraphState> Retrying<S> {
    pub fn new(inner: impl NodeAction<S> + 'static, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(inner),
            policy,
        }
    }

    fn wrap(inner: Arc<dyn NodeAction<S>>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: GraphState> NodeAction<S> for Retrying<S> {
    async fn execute(&self, cx: NodeContext, state: S) -> Result<S> {
        let mut attempt = 0u32;
        loop {
            let err = match self.inner.execute(cx.clone(), state.clone()).await {
                Ok(next) => return Ok(next),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.policy.max_retries {
                return Err(ConductorError::RetriesExhausted {
                    node: cx.node_id.clone(),
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.backoff.delay_for_attempt(attempt);
            tracing::warn!(
                node = %cx.node_id,
                attempt,
                delay_ms = %delay.as_millis(),
                error = %err,
                "Retryable error, retrying"
            );
            tokio::select! {
                _ = cx.cancellation().cancelled() => {
                    return Err(ConductorError::Cancelled { graph: cx.graph_id.clone() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl<S: GraphState> Node<S> {
    /// Re-run this node's action on retryable errors according to `policy`.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.action = Arc::new(Retrying::wrap(Arc::clone(&self.action), policy));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::StateMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn cx(token: CancellationToken) -> NodeContext {
        NodeContext::new("g", "exec", "flaky", token)
    }

    /// Fails with `error` for the first `failures` calls, then records the
    /// attempt number in the state.
    fn flaky(
        failures: u32,
        calls: Arc<AtomicU32>,
        error: fn() -> ConductorError,
    ) -> Node<StateMap> {
        Node::from_fn("flaky", move |_cx, mut state: StateMap| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    return Err(error());
                }
                state.set("attempt", n)?;
                Ok(state)
            }
        })
    }

    fn transient() -> ConductorError {
        ConductorError::Transient("connection reset".into())
    }

    #[tokio::test]
    async fn retryable_error_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky(2, calls.clone(), transient)
            .retry(RetryPolicy::new(3, BackoffPolicy::None));

        let out = node
            .action()
            .execute(cx(CancellationToken::new()), StateMap::new())
            .await
            .unwrap();
        assert_eq!(out.get_as::<u32>("attempt").unwrap(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky(10, calls.clone(), transient)
            .retry(RetryPolicy::new(2, BackoffPolicy::None));

        let err = node
            .action()
            .execute(cx(CancellationToken::new()), StateMap::new())
            .await
            .unwrap_err();
        match err {
            ConductorError::RetriesExhausted { node, attempts, source } => {
                assert_eq!(node, "flaky");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ConductorError::Transient(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_is_returned_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky(5, calls.clone(), || ConductorError::Other("bad input".into()))
            .retry(RetryPolicy::new(5, BackoffPolicy::None));

        let err = node
            .action()
            .execute(cx(CancellationToken::new()), StateMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Other(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky(10, calls.clone(), transient).retry(RetryPolicy::new(
            5,
            BackoffPolicy::Fixed(Duration::from_secs(60)),
        ));

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = node.action().execute(cx(token), StateMap::new()).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fixed_backoff_constant_delay() {
        let policy = BackoffPolicy::Fixed(Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(500));
    }

    #[test]
    fn retry_keeps_node_metadata() {
        let node: Node<StateMap> = Node::pass_through("n")
            .depends_on(["a"])
            .parallel()
            .retry(RetryPolicy::default());
        assert_eq!(node.dependencies(), &["a".to_string()]);
        assert!(node.is_parallel_safe());
    }
}
