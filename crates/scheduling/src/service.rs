//! Operator-facing handle over the running connection managers

use syncwarden_durable::{InstanceStatus, RuntimeError, WorkflowRuntime};
use tracing::{debug, info};

use crate::manager::{ConnectionManagerInput, ConnectionManagerWorkflow, ManagerDeps, ManagerExit};
use crate::signals::ConnectionSignal;
use crate::state::{ConnectionId, ConnectionManagerQuery, JobInformation, WorkflowState};

/// Hosts one manager per connection and routes operator calls to it
///
/// Signals to a manager that already terminated (a deleted connection) are
/// accepted and dropped; signals to a connection that was never started are
/// errors.
#[derive(Clone)]
pub struct ConnectionManagerService {
    runtime: WorkflowRuntime<ConnectionManagerWorkflow>,
}

impl ConnectionManagerService {
    pub fn new(deps: ManagerDeps) -> Self {
        let runtime =
            WorkflowRuntime::new(move |input| ConnectionManagerWorkflow::new(input, deps.clone()));
        Self { runtime }
    }

    /// Start the manager for a connection
    pub fn start_connection(&self, connection_id: ConnectionId) -> Result<(), RuntimeError> {
        self.resume_connection(ConnectionManagerInput::new(connection_id))
    }

    /// Start a manager from an explicit input, e.g. state saved at shutdown
    pub fn resume_connection(&self, input: ConnectionManagerInput) -> Result<(), RuntimeError> {
        let connection_id = input.connection_id;
        self.runtime.start(connection_id.instance_id(), input)?;
        info!(%connection_id, "connection manager started");
        Ok(())
    }

    pub fn submit_manual_sync(&self, connection_id: ConnectionId) -> Result<(), RuntimeError> {
        self.signal(connection_id, ConnectionSignal::SubmitManualSync)
    }

    pub fn cancel_job(&self, connection_id: ConnectionId) -> Result<(), RuntimeError> {
        self.signal(connection_id, ConnectionSignal::CancelJob)
    }

    pub fn delete_connection(&self, connection_id: ConnectionId) -> Result<(), RuntimeError> {
        self.signal(connection_id, ConnectionSignal::DeleteConnection)
    }

    pub fn connection_updated(&self, connection_id: ConnectionId) -> Result<(), RuntimeError> {
        self.signal(connection_id, ConnectionSignal::ConnectionUpdated)
    }

    pub fn reset_connection(&self, connection_id: ConnectionId) -> Result<(), RuntimeError> {
        self.signal(connection_id, ConnectionSignal::reset())
    }

    pub fn reset_connection_and_skip_next_scheduling(
        &self,
        connection_id: ConnectionId,
    ) -> Result<(), RuntimeError> {
        self.signal(connection_id, ConnectionSignal::reset_and_skip_next_scheduling())
    }

    fn signal(
        &self,
        connection_id: ConnectionId,
        signal: ConnectionSignal,
    ) -> Result<(), RuntimeError> {
        match self.runtime.signal(&connection_id.instance_id(), signal) {
            Err(RuntimeError::InstanceClosed(_)) => {
                debug!(
                    %connection_id,
                    signal = signal.name(),
                    "manager terminated, signal dropped"
                );
                Ok(())
            }
            result => result,
        }
    }

    /// Current state flags, without waiting on the manager
    pub fn get_state(&self, connection_id: ConnectionId) -> Result<WorkflowState, RuntimeError> {
        Ok(self.snapshot(connection_id)?.state)
    }

    /// Job and attempt currently in flight, or the idle sentinels
    pub fn get_job_information(
        &self,
        connection_id: ConnectionId,
    ) -> Result<JobInformation, RuntimeError> {
        Ok(self.snapshot(connection_id)?.job)
    }

    /// Full query snapshot
    pub fn snapshot(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ConnectionManagerQuery, RuntimeError> {
        self.runtime.query(&connection_id.instance_id())
    }

    /// Wait until the manager publishes a snapshot matching `predicate`
    pub async fn wait_for<P>(
        &self,
        connection_id: ConnectionId,
        predicate: P,
    ) -> Result<ConnectionManagerQuery, RuntimeError>
    where
        P: FnMut(&ConnectionManagerQuery) -> bool,
    {
        self.runtime
            .wait_for_query(&connection_id.instance_id(), predicate)
            .await
    }

    /// Wait for the manager to stop for good
    pub async fn wait_until_terminated(
        &self,
        connection_id: ConnectionId,
    ) -> Result<InstanceStatus<ManagerExit>, RuntimeError> {
        self.runtime
            .wait_for_completion(&connection_id.instance_id())
            .await
    }

    /// Runtime status of the manager, including its incarnation
    pub fn status(
        &self,
        connection_id: ConnectionId,
    ) -> Result<InstanceStatus<ManagerExit>, RuntimeError> {
        self.runtime.status(&connection_id.instance_id())
    }

    /// Whether the connection's manager is still running
    pub fn is_running(&self, connection_id: ConnectionId) -> bool {
        self.runtime.is_running(&connection_id.instance_id())
    }

    /// Abort every manager task
    pub fn shutdown(&self) {
        self.runtime.shutdown();
    }
}
