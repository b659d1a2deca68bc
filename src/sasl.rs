//! pluggable SASL mechanisms

use crate::context::ServerContext;
use crate::error::DirectoryError;
use crate::operation::OperationRecord;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// the outcome of one round of a SASL bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslBindOutcome {
    /// the client is authenticated, the handler has set the user entry
    Success {
        /// final credentials for the client
        server_credentials: Option<Vec<u8>>,
    },
    /// the mechanism needs another round trip
    InProgress {
        /// the challenge for the client
        server_credentials: Option<Vec<u8>>,
    },
    /// authentication failed
    Failure {
        /// the detailed reason, only logged
        reason: String,
    },
}

/// a SASL mechanism
pub trait SaslMechanismHandler: std::fmt::Debug + Send + Sync {
    /// the mechanism name, e.g. `PLAIN`
    fn mechanism(&self) -> &str;

    /// whether the mechanism verifies a password of the user entry, only
    /// then does password policy failure accounting apply
    fn is_password_based(&self) -> bool;

    /// whether the mechanism protects the credentials on its own
    fn is_secure(&self) -> bool;

    /// process one round
    ///
    /// on success the handler stores the user entry in the bind payload of
    /// the operation
    fn process_sasl_bind(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
    ) -> Result<SaslBindOutcome, DirectoryError>;
}

/// the registered SASL mechanisms
#[derive(Debug, Default)]
pub struct SaslRegistry {
    /// handlers keyed by uppercased mechanism name
    handlers: RwLock<HashMap<String, Arc<dyn SaslMechanismHandler>>>,
}

impl SaslRegistry {
    /// an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// register a mechanism, replacing one with the same name
    pub fn register(&self, handler: Arc<dyn SaslMechanismHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handler.mechanism().to_uppercase(), handler);
    }

    /// remove a mechanism
    pub fn deregister(&self, mechanism: &str) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&mechanism.to_uppercase());
    }

    /// the handler for a mechanism, case-insensitive
    pub fn handler(&self, mechanism: &str) -> Option<Arc<dyn SaslMechanismHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&mechanism.to_uppercase())
            .cloned()
    }

    /// the supported mechanism names, sorted
    pub fn mechanisms(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
