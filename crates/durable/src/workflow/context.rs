//! Per-incarnation workflow context

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::WorkflowSignal;
use crate::serde_duration::saturating_millis;

/// Longest single timer armed by the context; longer waits re-arm
const MAX_TIMER: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Deadline used for waits too long to represent
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Publishes query snapshots for an instance
///
/// Queries never wait on the workflow: the runtime answers from the latest
/// published value.
pub struct QueryPublisher<Q> {
    sender: Arc<watch::Sender<Q>>,
}

impl<Q> Clone for QueryPublisher<Q> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Q> QueryPublisher<Q> {
    pub(crate) fn new(sender: watch::Sender<Q>) -> Self {
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Replace the published snapshot
    pub fn publish(&self, snapshot: Q) {
        self.sender.send_replace(snapshot);
    }
}

/// Why a sleep ended
#[derive(Debug, PartialEq)]
pub enum Wake<S> {
    /// The full duration elapsed
    Elapsed,

    /// A signal arrived first
    Signal(S),
}

/// Result of [`WorkflowContext::run_interruptible`]
#[derive(Debug, PartialEq)]
pub enum Interruptible<T, I> {
    /// The work finished without being interrupted
    Completed(T),

    /// A signal interrupted the work
    Interrupted {
        /// What the signal handler asked for
        reason: I,

        /// The work's own result if it unwound within the grace period
        unwound: Option<T>,
    },
}

impl<T, I> Interruptible<T, I> {
    /// True if the work was dropped after the grace period expired
    pub fn was_forced(&self) -> bool {
        matches!(self, Self::Interrupted { unwound: None, .. })
    }
}

/// Context handed to one incarnation of a workflow
///
/// The context owns the instance mailbox for the duration of the
/// incarnation. Signals are only ever observed at the points where the
/// workflow calls into the context: [`drain_signals`](Self::drain_signals),
/// [`sleep_or_signal`](Self::sleep_or_signal) and
/// [`run_interruptible`](Self::run_interruptible). Between those points the
/// workflow runs undisturbed.
pub struct WorkflowContext<S, Q> {
    instance_id: String,
    incarnation: u32,
    mailbox: mpsc::UnboundedReceiver<WorkflowSignal<S>>,
    publisher: QueryPublisher<Q>,
}

impl<S, Q> WorkflowContext<S, Q>
where
    S: std::fmt::Debug,
{
    pub(crate) fn new(
        instance_id: String,
        incarnation: u32,
        mailbox: mpsc::UnboundedReceiver<WorkflowSignal<S>>,
        publisher: QueryPublisher<Q>,
    ) -> Self {
        Self {
            instance_id,
            incarnation,
            mailbox,
            publisher,
        }
    }

    pub(crate) fn into_mailbox(self) -> mpsc::UnboundedReceiver<WorkflowSignal<S>> {
        self.mailbox
    }

    /// Instance this context belongs to
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 1-based incarnation number (increments on every continue-as-new)
    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    /// Publish a query snapshot
    pub fn publish(&self, snapshot: Q) {
        self.publisher.publish(snapshot);
    }

    /// Clone the publisher, for use inside signal handlers
    pub fn publisher(&self) -> QueryPublisher<Q> {
        self.publisher.clone()
    }

    /// Take every signal queued so far without waiting
    pub fn drain_signals(&mut self) -> Vec<S> {
        let mut drained = Vec::new();
        while let Ok(signal) = self.mailbox.try_recv() {
            drained.push(self.receive(signal));
        }
        drained
    }

    /// Sleep for `duration`, waking early if a signal arrives
    pub async fn sleep_or_signal(&mut self, duration: Duration) -> Wake<S> {
        let deadline = Instant::now()
            .checked_add(duration)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        self.sleep_until_or_signal(deadline).await
    }

    /// Sleep until `deadline`, waking early if a signal arrives
    pub async fn sleep_until_or_signal(&mut self, deadline: Instant) -> Wake<S> {
        loop {
            let step = deadline.min(Instant::now() + MAX_TIMER);
            tokio::select! {
                biased;
                Some(signal) = self.mailbox.recv() => {
                    return Wake::Signal(self.receive(signal));
                }
                _ = tokio::time::sleep_until(step) => {
                    if step >= deadline {
                        return Wake::Elapsed;
                    }
                }
            }
        }
    }

    /// Run `work` while still serving the mailbox
    ///
    /// Every signal that arrives while `work` is pending is passed to
    /// `on_signal`. Returning `Some(reason)` interrupts the work: `cancel` is
    /// triggered and the work gets `grace` to finish on its own before it is
    /// dropped. Signals arriving during the grace period stay queued.
    pub async fn run_interruptible<F, T, I, H>(
        &mut self,
        work: F,
        cancel: &CancellationToken,
        grace: Duration,
        mut on_signal: H,
    ) -> Interruptible<T, I>
    where
        F: Future<Output = T>,
        H: FnMut(S) -> Option<I>,
    {
        tokio::pin!(work);

        let reason = loop {
            tokio::select! {
                biased;
                Some(signal) = self.mailbox.recv() => {
                    let signal = self.receive(signal);
                    if let Some(reason) = on_signal(signal) {
                        break reason;
                    }
                }
                output = &mut work => return Interruptible::Completed(output),
            }
        };

        cancel.cancel();
        match tokio::time::timeout(grace, &mut work).await {
            Ok(output) => Interruptible::Interrupted {
                reason,
                unwound: Some(output),
            },
            Err(_) => {
                warn!(
                    instance_id = %self.instance_id,
                    grace_ms = saturating_millis(grace),
                    "interrupted work did not unwind within grace period, dropping it"
                );
                Interruptible::Interrupted {
                    reason,
                    unwound: None,
                }
            }
        }
    }

    fn receive(&self, signal: WorkflowSignal<S>) -> S {
        debug!(
            instance_id = %self.instance_id,
            incarnation = self.incarnation,
            queued_ms = signal.queued_ms(),
            signal = ?signal.payload,
            "signal received"
        );
        signal.into_payload()
    }
}
