//! cooperative cancellation of in-flight operations
//!
//! the cancelling side records a [CancelRequest] and polls for a
//! [CancelResult]; the operation checks for a pending request at its poll
//! points and answers with [CancelResult::Canceled], or with
//! [CancelResult::TooLate] once its backend mutation has begun. A result is
//! set at most once and never changes afterwards.

use crate::result_code::ResultCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::instrument;

/// the default interval at which a cancel request polls for the result
pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// the default bound on how long a cancel request waits for the result
pub const DEFAULT_CANCEL_WAIT_BOUND: Duration = Duration::from_secs(5);

/// a request to cancel an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    /// whether the client that sent the canceled operation gets a response
    pub notify_original_requester: bool,
    /// why the operation is canceled
    pub reason: String,
}

impl CancelRequest {
    /// create a new cancel request
    pub fn new(notify_original_requester: bool, reason: impl Into<String>) -> Self {
        Self {
            notify_original_requester,
            reason: reason.into(),
        }
    }
}

/// the outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// the operation was canceled
    Canceled,
    /// the operation cannot be canceled or did not react in time
    CannotCancel,
    /// the operation already passed the point of no return
    TooLate,
    /// there is no such operation
    NoSuchOperation,
}

impl CancelResult {
    /// the result code reported to the client that asked for cancellation
    pub fn result_code(self) -> ResultCode {
        match self {
            CancelResult::Canceled => ResultCode::Canceled,
            CancelResult::CannotCancel => ResultCode::CannotCancel,
            CancelResult::TooLate => ResultCode::TooLate,
            CancelResult::NoSuchOperation => ResultCode::NoSuchOperation,
        }
    }
}

/// cancellation state shared between an operation and its cancellers
#[derive(Debug)]
pub struct CancelState {
    /// whether the operation supports cancellation at all
    cancellable: bool,
    /// the pending cancel request
    request: Mutex<Option<CancelRequest>>,
    /// the answer to the cancel request, set at most once
    result: Mutex<Option<CancelResult>>,
}

impl CancelState {
    /// create the state for a new operation
    pub fn new(cancellable: bool) -> Self {
        Self {
            cancellable,
            request: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    /// whether the operation supports cancellation
    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    /// record a cancel request
    ///
    /// returns the result right away if one is already known, in which case
    /// the request is not recorded
    pub fn request_cancel(&self, request: CancelRequest) -> Option<CancelResult> {
        if !self.cancellable {
            return Some(CancelResult::CannotCancel);
        }
        if let Some(result) = self.result() {
            return Some(result);
        }
        let mut pending = self.request.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_none() {
            *pending = Some(request);
        }
        None
    }

    /// the pending cancel request
    pub fn cancel_request(&self) -> Option<CancelRequest> {
        self.request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// the answer to the cancel request, if any
    pub fn result(&self) -> Option<CancelResult> {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// set the answer unless one was set before
    ///
    /// returns whether this call set it
    pub fn set_result(&self, result: CancelResult) -> bool {
        let mut current = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return false;
        }
        *current = Some(result);
        true
    }

    /// mark the point of no return, later cancel requests get TOO_LATE
    pub fn mark_too_late(&self) {
        self.set_result(CancelResult::TooLate);
    }

    /// poll point: whether the operation has to stop because of a cancel
    /// request
    ///
    /// the first positive check answers the request with CANCELED
    pub fn check_for_cancellation(&self) -> bool {
        if self.cancel_request().is_none() {
            return false;
        }
        self.set_result(CancelResult::Canceled);
        self.result() == Some(CancelResult::Canceled)
    }
}

/// handle used to cancel an operation from another task
#[derive(Debug, Clone)]
pub struct CancelHandle {
    /// the shared state of the operation
    state: Arc<CancelState>,
    /// how often the result is polled
    poll_interval: Duration,
    /// how long the result is waited for
    wait_bound: Duration,
}

impl CancelHandle {
    /// create a handle for the shared state of an operation
    pub fn new(state: Arc<CancelState>, poll_interval: Duration, wait_bound: Duration) -> Self {
        Self {
            state,
            poll_interval,
            wait_bound,
        }
    }

    /// the shared cancel state
    pub fn state(&self) -> &Arc<CancelState> {
        &self.state
    }

    /// request cancellation and wait for the operation to answer
    ///
    /// gives up with CANNOT_CANCEL after the wait bound, without the
    /// guarantee that the operation does not stop later
    #[instrument(skip(self))]
    pub async fn cancel(&self, request: CancelRequest) -> CancelResult {
        if let Some(result) = self.state.request_cancel(request) {
            return result;
        }
        let deadline = tokio::time::Instant::now() + self.wait_bound;
        loop {
            if let Some(result) = self.state.result() {
                return result;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!("Operation did not answer the cancel request in time");
                return CancelResult::CannotCancel;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// blocking variant of [CancelHandle::cancel] for callers outside of
    /// an async runtime
    pub fn cancel_blocking(&self, request: CancelRequest) -> CancelResult {
        if let Some(result) = self.state.request_cancel(request) {
            return result;
        }
        let deadline = std::time::Instant::now() + self.wait_bound;
        loop {
            if let Some(result) = self.state.result() {
                return result;
            }
            if std::time::Instant::now() >= deadline {
                return CancelResult::CannotCancel;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
