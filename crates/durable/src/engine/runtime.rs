//! In-process workflow runtime
//!
//! The `WorkflowRuntime` is responsible for:
//! - Starting workflow instances (at most one live instance per id)
//! - Routing signals into instance mailboxes
//! - Answering queries from the latest published snapshot
//! - Driving continue-as-new hand-offs between incarnations

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::workflow::{
    QueryPublisher, Workflow, WorkflowContext, WorkflowError, WorkflowOutcome, WorkflowSignal,
};

/// Errors from runtime operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// An instance with this id was already started
    #[error("workflow instance already exists: {0}")]
    AlreadyExists(String),

    /// No instance with this id
    #[error("workflow instance not found: {0}")]
    NotFound(String),

    /// The instance has finished and no longer accepts signals
    #[error("workflow instance {0} is closed")]
    InstanceClosed(String),
}

/// Lifecycle status of an instance
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus<O> {
    /// An incarnation is running
    Running { incarnation: u32 },

    /// The workflow completed
    Completed { output: O, incarnations: u32 },

    /// The workflow returned an error
    Failed { error: WorkflowError },
}

impl<O> InstanceStatus<O> {
    /// True once the instance will never run again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

struct InstanceEntry<W: Workflow> {
    signals: mpsc::UnboundedSender<WorkflowSignal<W::Signal>>,
    queries: watch::Receiver<W::Query>,
    status: watch::Receiver<InstanceStatus<W::Output>>,
    task: JoinHandle<()>,
}

type Factory<W> = Arc<dyn Fn(<W as Workflow>::Input) -> W + Send + Sync>;

/// Runtime hosting instances of one workflow type
///
/// Each instance runs on its own tokio task. The runtime keeps a registry of
/// instances keyed by id; an id stays registered after the instance finishes
/// (so late signals are rejected rather than starting a new instance) until
/// [`forget`](Self::forget) is called.
///
/// # Example
///
/// ```ignore
/// use syncwarden_durable::prelude::*;
///
/// let runtime = WorkflowRuntime::new(|input| MyWorkflow::new(input));
/// runtime.start("instance-1", input)?;
/// runtime.signal("instance-1", MySignal::Wake)?;
/// let snapshot = runtime.query("instance-1")?;
/// ```
pub struct WorkflowRuntime<W: Workflow> {
    instances: Arc<DashMap<String, InstanceEntry<W>>>,
    factory: Factory<W>,
}

impl<W: Workflow> Clone for WorkflowRuntime<W> {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<W: Workflow> WorkflowRuntime<W> {
    /// Create a runtime that builds each incarnation with `factory`
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(W::Input) -> W + Send + Sync + 'static,
    {
        Self {
            instances: Arc::new(DashMap::new()),
            factory: Arc::new(factory),
        }
    }

    /// Start a new instance
    ///
    /// Must be called from within a tokio runtime. Fails if any instance
    /// (live or finished) is registered under `instance_id`.
    pub fn start(
        &self,
        instance_id: impl Into<String>,
        input: W::Input,
    ) -> Result<(), RuntimeError> {
        let instance_id = instance_id.into();
        let slot = match self.instances.entry(instance_id.clone()) {
            Entry::Occupied(_) => return Err(RuntimeError::AlreadyExists(instance_id)),
            Entry::Vacant(slot) => slot,
        };

        let workflow = (self.factory)(input);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = watch::channel(workflow.query());
        let (status_tx, status_rx) = watch::channel(InstanceStatus::Running { incarnation: 1 });

        let span = info_span!(
            "workflow",
            workflow_type = W::TYPE,
            instance_id = %instance_id
        );
        let task = tokio::spawn(
            drive(
                instance_id.clone(),
                workflow,
                signal_rx,
                QueryPublisher::new(query_tx),
                status_tx,
                self.factory.clone(),
            )
            .instrument(span),
        );

        slot.insert(InstanceEntry {
            signals: signal_tx,
            queries: query_rx,
            status: status_rx,
            task,
        });

        info!(workflow_type = W::TYPE, instance_id = %instance_id, "workflow started");
        Ok(())
    }

    /// Queue a signal for an instance
    ///
    /// Signals are delivered in send order and observed at the workflow's
    /// next checkpoint.
    pub fn signal(&self, instance_id: &str, signal: W::Signal) -> Result<(), RuntimeError> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| RuntimeError::NotFound(instance_id.to_string()))?;

        if entry.status.borrow().is_terminal() {
            return Err(RuntimeError::InstanceClosed(instance_id.to_string()));
        }

        entry
            .signals
            .send(WorkflowSignal::new(signal))
            .map_err(|_| RuntimeError::InstanceClosed(instance_id.to_string()))
    }

    /// Latest query snapshot published by an instance
    pub fn query(&self, instance_id: &str) -> Result<W::Query, RuntimeError> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.queries.borrow().clone())
            .ok_or_else(|| RuntimeError::NotFound(instance_id.to_string()))
    }

    /// Current lifecycle status of an instance
    pub fn status(&self, instance_id: &str) -> Result<InstanceStatus<W::Output>, RuntimeError> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.status.borrow().clone())
            .ok_or_else(|| RuntimeError::NotFound(instance_id.to_string()))
    }

    /// True if the instance exists and has not finished
    pub fn is_running(&self, instance_id: &str) -> bool {
        self.instances
            .get(instance_id)
            .is_some_and(|entry| !entry.status.borrow().is_terminal())
    }

    /// Ids of every registered instance
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Wait until the instance publishes a snapshot matching `predicate`
    ///
    /// Returns immediately if the current snapshot already matches. Fails
    /// with [`RuntimeError::InstanceClosed`] if the instance finishes without
    /// ever matching.
    pub async fn wait_for_query<P>(
        &self,
        instance_id: &str,
        predicate: P,
    ) -> Result<W::Query, RuntimeError>
    where
        P: FnMut(&W::Query) -> bool,
    {
        let mut queries = self.subscribe_queries(instance_id)?;
        let snapshot = queries
            .wait_for(predicate)
            .await
            .map_err(|_| RuntimeError::InstanceClosed(instance_id.to_string()))?
            .clone();
        Ok(snapshot)
    }

    /// Wait for the instance to complete or fail
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
    ) -> Result<InstanceStatus<W::Output>, RuntimeError> {
        let mut status = self
            .instances
            .get(instance_id)
            .map(|entry| entry.status.clone())
            .ok_or_else(|| RuntimeError::NotFound(instance_id.to_string()))?;

        let finished = status
            .wait_for(InstanceStatus::is_terminal)
            .await
            .map_err(|_| RuntimeError::InstanceClosed(instance_id.to_string()))?
            .clone();
        Ok(finished)
    }

    /// Drop a finished instance from the registry
    ///
    /// Returns false if the instance is unknown or still running.
    pub fn forget(&self, instance_id: &str) -> bool {
        self.instances
            .remove_if(instance_id, |_, entry| entry.status.borrow().is_terminal())
            .is_some()
    }

    /// Abort every running instance
    pub fn shutdown(&self) {
        let mut aborted = 0usize;
        for entry in self.instances.iter() {
            if !entry.task.is_finished() {
                entry.task.abort();
                aborted += 1;
            }
        }
        info!(workflow_type = W::TYPE, aborted, "workflow runtime shut down");
    }

    fn subscribe_queries(
        &self,
        instance_id: &str,
    ) -> Result<watch::Receiver<W::Query>, RuntimeError> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.queries.clone())
            .ok_or_else(|| RuntimeError::NotFound(instance_id.to_string()))
    }
}

/// Drive an instance through its incarnations until it completes or fails
async fn drive<W: Workflow>(
    instance_id: String,
    mut workflow: W,
    mut mailbox: mpsc::UnboundedReceiver<WorkflowSignal<W::Signal>>,
    publisher: QueryPublisher<W::Query>,
    status: watch::Sender<InstanceStatus<W::Output>>,
    factory: Factory<W>,
) {
    let mut incarnation = 1;
    loop {
        let mut ctx =
            WorkflowContext::new(instance_id.clone(), incarnation, mailbox, publisher.clone());
        let outcome = workflow.run(&mut ctx).await;
        mailbox = ctx.into_mailbox();

        match outcome {
            Ok(WorkflowOutcome::ContinueAsNew(input)) => {
                let input = match hand_off::<W>(&input) {
                    Ok(input) => input,
                    Err(e) => {
                        error!(
                            incarnation,
                            error = %e,
                            "continue-as-new payload did not round-trip"
                        );
                        status.send_replace(InstanceStatus::Failed {
                            error: WorkflowError::new(format!("hand-off failed: {e}"))
                                .with_code("HANDOFF_FAILED"),
                        });
                        return;
                    }
                };

                workflow = factory(input);
                incarnation += 1;
                publisher.publish(workflow.query());
                status.send_replace(InstanceStatus::Running { incarnation });
                debug!(incarnation, "continued as new");
            }
            Ok(WorkflowOutcome::Completed(output)) => {
                info!(incarnations = incarnation, output = ?output, "workflow completed");
                status.send_replace(InstanceStatus::Completed {
                    output,
                    incarnations: incarnation,
                });
                return;
            }
            Err(e) => {
                error!(incarnation, error = %e, "workflow failed");
                status.send_replace(InstanceStatus::Failed { error: e });
                return;
            }
        }
    }
}

/// Serialize and re-read a continue-as-new payload
///
/// The next incarnation only ever sees what survives serialization.
fn hand_off<W: Workflow>(input: &W::Input) -> Result<W::Input, serde_json::Error> {
    serde_json::to_value(input).and_then(serde_json::from_value)
}
