//! runs operations on worker threads and keeps track of them for
//! cancellation
//!
//! every operation runs on the tokio blocking pool. While a bind runs on a
//! connection, operations submitted on the same connection wait until it
//! finished.

use crate::cancel::{CancelHandle, CancelRequest, CancelResult};
use crate::connection::ClientConnection;
use crate::operation::{OperationRecord, OperationType};
use crate::pipeline::{ExecutionOutcome, OperationPipeline};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::instrument;

/// errors running an operation
#[derive(Debug, Error)]
pub enum DispatchError {
    /// the worker running the operation panicked or was aborted
    #[error("Operation worker failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// per connection bookkeeping
#[derive(Debug, Default)]
struct ConnectionOperations {
    /// held by a running bind
    bind_gate: Arc<tokio::sync::Mutex<()>>,
    /// cancel handles of the running operations keyed by message id
    in_flight: Mutex<HashMap<i32, CancelHandle>>,
}

impl ConnectionOperations {
    /// remember a running operation until the returned guard is dropped
    fn register(self: &Arc<Self>, message_id: i32, handle: CancelHandle) -> InFlight {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_id, handle);
        InFlight {
            operations: Arc::clone(self),
            message_id,
        }
    }

    /// forget a finished operation
    fn deregister(&self, message_id: i32) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&message_id);
    }

    /// the cancel handle of a running operation
    fn handle(&self, message_id: i32) -> Option<CancelHandle> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_id)
            .cloned()
    }

    /// the cancel handles of all running operations but one
    fn handles_except(&self, message_id: i32) -> Vec<(i32, CancelHandle)> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(id, _)| **id != message_id)
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    /// the number of running operations
    fn len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// registration of a running operation, removed again on drop
#[derive(Debug)]
struct InFlight {
    /// the bookkeeping the operation is registered with
    operations: Arc<ConnectionOperations>,
    /// message id of the operation
    message_id: i32,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.operations.deregister(self.message_id);
    }
}

/// schedules operations and routes cancel requests to them
#[derive(Debug)]
pub struct OperationDispatcher {
    /// the pipeline operations are executed with
    pipeline: OperationPipeline,
    /// bookkeeping per connection id
    connections: Mutex<HashMap<u64, Arc<ConnectionOperations>>>,
}

impl OperationDispatcher {
    /// create a dispatcher
    pub fn new(pipeline: OperationPipeline) -> Self {
        Self {
            pipeline,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// the pipeline operations are executed with
    pub fn pipeline(&self) -> &OperationPipeline {
        &self.pipeline
    }

    /// the bookkeeping of a connection, created on first use
    fn connection(&self, connection_id: u64) -> Arc<ConnectionOperations> {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(connections.entry(connection_id).or_default())
    }

    /// the bookkeeping of a connection if it has any
    fn existing_connection(&self, connection_id: u64) -> Option<Arc<ConnectionOperations>> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&connection_id)
            .cloned()
    }

    /// run an operation on a worker and wait for it to finish
    ///
    /// the operation record is handed back with its result fields filled
    #[instrument(
        skip_all,
        fields(conn = operation.connection_id(), msg_id = operation.message_id())
    )]
    pub async fn execute(
        &self,
        mut operation: OperationRecord,
        connection: Arc<dyn ClientConnection>,
    ) -> Result<(OperationRecord, ExecutionOutcome), DispatchError> {
        let message_id = operation.message_id();
        let operations = self.connection(operation.connection_id());
        let bind_guard = if operation.operation_type() == OperationType::Bind {
            Some(Arc::clone(&operations.bind_gate).lock_owned().await)
        } else {
            drop(operations.bind_gate.lock().await);
            None
        };
        let config = self.pipeline.context().config();
        let in_flight = operations.register(
            message_id,
            operation.cancel_handle(config.cancel_poll_interval(), config.cancel_wait_bound()),
        );
        let pipeline = self.pipeline.clone();
        let result = tokio::task::spawn_blocking(move || {
            let outcome = pipeline.execute(&mut operation, connection.as_ref());
            (operation, outcome)
        })
        .await;
        drop(in_flight);
        drop(bind_guard);
        Ok(result?)
    }

    /// cancel a running operation and wait for its answer
    #[instrument(skip(self, request))]
    pub async fn cancel(
        &self,
        connection_id: u64,
        message_id: i32,
        request: CancelRequest,
    ) -> CancelResult {
        let handle = self
            .existing_connection(connection_id)
            .and_then(|operations| operations.handle(message_id));
        match handle {
            Some(handle) => handle.cancel(request).await,
            None => {
                tracing::debug!("No operation to cancel");
                CancelResult::NoSuchOperation
            }
        }
    }

    /// cancel every running operation of a connection except one and wait
    /// for all answers
    #[instrument(skip(self, request))]
    pub async fn cancel_all_except(
        &self,
        connection_id: u64,
        except_message_id: i32,
        request: CancelRequest,
    ) -> Vec<(i32, CancelResult)> {
        let Some(operations) = self.existing_connection(connection_id) else {
            return Vec::new();
        };
        let mut cancels = JoinSet::new();
        for (message_id, handle) in operations.handles_except(except_message_id) {
            let request = request.clone();
            cancels.spawn(async move { (message_id, handle.cancel(request).await) });
        }
        let mut results = Vec::new();
        while let Some(result) = cancels.join_next().await {
            match result {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Cancel task failed: {}", e),
            }
        }
        results.sort_by_key(|(message_id, _)| *message_id);
        results
    }

    /// the number of operations running on a connection
    pub fn in_flight_count(&self, connection_id: u64) -> usize {
        self.existing_connection(connection_id)
            .map(|operations| operations.len())
            .unwrap_or_default()
    }

    /// forget a closed connection
    pub fn remove_connection(&self, connection_id: u64) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&connection_id);
    }
}
