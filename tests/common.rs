#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use ldap_opcore::backend::memory::MemoryBackend;
use ldap_opcore::backend::Backend;
use ldap_opcore::cancel::CancelRequest;
use ldap_opcore::connection::{AuthenticationInfo, ClientConnection, DisconnectReason, Privilege};
use ldap_opcore::control::ResponseControl;
use ldap_opcore::operation::OperationPayload;
use ldap_opcore::password_policy::{
    AccountStatusNotification, AccountStatusNotificationHandler, AccountStatusNotificationType,
    PasswordPolicy, PWD_CHANGED_TIME,
};
use ldap_opcore::time::{format_generalized_time, Clock, ManualClock};
use ldap_opcore::{
    Dn, Entry, ExecutionOutcome, OperationPipeline, OperationRecord, ResultCode, ServerConfig,
    ServerContext, ServerContextBuilder,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// route log output of the code under test to the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// a response as the transport would have written it
#[derive(Debug, Clone)]
pub struct SentResponse {
    pub message_id: i32,
    pub result_code: Option<ResultCode>,
    pub error_message: String,
    pub controls: Vec<ResponseControl>,
}

/// a connection that remembers everything the pipeline asked of it
#[derive(Debug)]
pub struct RecordingConnection {
    id: u64,
    secure: bool,
    privileges: Mutex<HashSet<Privilege>>,
    authentication: Mutex<AuthenticationInfo>,
    responses: Mutex<Vec<SentResponse>>,
    entries: Mutex<Vec<Entry>>,
    entry_limit: Option<usize>,
    disconnects: Mutex<Vec<(DisconnectReason, String)>>,
    must_change_password: Mutex<bool>,
    resource_limits: Mutex<(Option<u32>, Option<u32>)>,
    bind_in_progress: Mutex<bool>,
    cancel_all_requests: Mutex<Vec<i32>>,
}

impl RecordingConnection {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            secure: false,
            privileges: Mutex::new(HashSet::new()),
            authentication: Mutex::new(AuthenticationInfo::anonymous()),
            responses: Mutex::new(Vec::new()),
            entries: Mutex::new(Vec::new()),
            entry_limit: None,
            disconnects: Mutex::new(Vec::new()),
            must_change_password: Mutex::new(false),
            resource_limits: Mutex::new((None, None)),
            bind_in_progress: Mutex::new(false),
            cancel_all_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// stop accepting search entries after this many
    pub fn accepting_entries(mut self, limit: usize) -> Self {
        self.entry_limit = Some(limit);
        self
    }

    pub fn grant(&self, privilege: Privilege) {
        self.privileges.lock().unwrap().insert(privilege);
    }

    pub fn authenticate_as(&self, dn: Dn) {
        *self.authentication.lock().unwrap() = AuthenticationInfo {
            authentication_dn: Some(dn.clone()),
            authorization_dn: Some(dn),
            is_root: false,
            sasl_mechanism: None,
        };
    }

    pub fn authenticated_dn(&self) -> Option<Dn> {
        self.authentication
            .lock()
            .unwrap()
            .authentication_dn
            .clone()
    }

    pub fn responses(&self) -> Vec<SentResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub fn last_response(&self) -> SentResponse {
        self.responses().last().cloned().expect("no response was sent")
    }

    pub fn search_entries(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<(DisconnectReason, String)> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn must_change_password(&self) -> bool {
        *self.must_change_password.lock().unwrap()
    }

    pub fn resource_limits(&self) -> (Option<u32>, Option<u32>) {
        *self.resource_limits.lock().unwrap()
    }

    pub fn bind_in_progress(&self) -> bool {
        *self.bind_in_progress.lock().unwrap()
    }

    pub fn cancel_all_requests(&self) -> Vec<i32> {
        self.cancel_all_requests.lock().unwrap().clone()
    }
}

impl ClientConnection for RecordingConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn authentication_info(&self) -> AuthenticationInfo {
        self.authentication.lock().unwrap().clone()
    }

    fn set_authentication_info(&self, info: AuthenticationInfo) {
        *self.authentication.lock().unwrap() = info;
    }

    fn has_privilege(&self, privilege: Privilege) -> bool {
        self.privileges.lock().unwrap().contains(&privilege)
    }

    fn set_resource_limits(&self, size_limit: Option<u32>, time_limit: Option<u32>) {
        *self.resource_limits.lock().unwrap() = (size_limit, time_limit);
    }

    fn set_must_change_password(&self, must_change: bool) {
        *self.must_change_password.lock().unwrap() = must_change;
    }

    fn set_bind_in_progress(&self, in_progress: bool) {
        *self.bind_in_progress.lock().unwrap() = in_progress;
    }

    fn send_response(&self, operation: &OperationRecord) {
        self.responses.lock().unwrap().push(SentResponse {
            message_id: operation.message_id(),
            result_code: operation.result_code(),
            error_message: operation.error_message().to_string(),
            controls: operation.response_controls().to_vec(),
        });
    }

    fn send_search_entry(&self, _operation: &OperationRecord, entry: &Entry) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if self.entry_limit.is_some_and(|limit| entries.len() >= limit) {
            return false;
        }
        entries.push(entry.clone());
        true
    }

    fn disconnect(&self, reason: DisconnectReason, _notify_client: bool, message: &str) {
        self.disconnects
            .lock()
            .unwrap()
            .push((reason, message.to_string()));
    }

    fn cancel_all_operations_except(&self, _request: &CancelRequest, except_message_id: i32) {
        self.cancel_all_requests
            .lock()
            .unwrap()
            .push(except_message_id);
    }
}

/// collects account status notifications
#[derive(Debug, Default)]
pub struct RecordingStatusHandler {
    notifications: Mutex<Vec<AccountStatusNotification>>,
}

impl RecordingStatusHandler {
    pub fn types(&self) -> Vec<AccountStatusNotificationType> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.notification_type)
            .collect()
    }
}

impl AccountStatusNotificationHandler for RecordingStatusHandler {
    fn handle_status_notification(&self, notification: &AccountStatusNotification) {
        self.notifications.lock().unwrap().push(notification.clone());
    }
}

/// `dc=example` with two people, an organizational unit and a password
/// for alice
pub fn example_backend() -> MemoryBackend {
    let backend = MemoryBackend::new("userRoot", vec![dn("dc=example")]);
    backend.load(
        Entry::new(dn("dc=example"))
            .with_attribute("objectClass", ["top", "domain"])
            .with_attribute("dc", ["example"]),
    );
    backend.load(
        Entry::new(dn("ou=people,dc=example"))
            .with_attribute("objectClass", ["top", "organizationalUnit"])
            .with_attribute("ou", ["people"]),
    );
    backend.load(
        Entry::new(dn("uid=alice,dc=example"))
            .with_attribute("objectClass", ["top", "person", "account"])
            .with_attribute("uid", ["alice"])
            .with_attribute("cn", ["Alice Liddell"])
            .with_attribute("sn", ["Liddell"])
            .with_attribute("userPassword", ["{CLEAR}secret"])
            .with_attribute(
                PWD_CHANGED_TIME,
                [format_generalized_time(&(start_time() - Duration::days(10)))],
            ),
    );
    backend.load(
        Entry::new(dn("cn=bob,dc=example"))
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", ["bob"])
            .with_attribute("sn", ["Builder"]),
    );
    backend
}

/// a server context around the example backend with a manual clock
#[derive(Debug)]
pub struct Fixture {
    pub context: Arc<ServerContext>,
    pub pipeline: OperationPipeline,
    pub backend: Arc<MemoryBackend>,
    pub clock: Arc<ManualClock>,
    pub status: Arc<RecordingStatusHandler>,
    next_id: AtomicU64,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_policy(policy: PasswordPolicy) -> Self {
        Self::with_config(ServerConfig {
            default_password_policy: policy,
            ..ServerConfig::default()
        })
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self::customized(config, |builder| builder)
    }

    /// a fixture with collaborators the default context does not have
    pub fn customized(
        config: ServerConfig,
        customize: impl FnOnce(ServerContextBuilder) -> ServerContextBuilder,
    ) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(start_time()));
        let status = Arc::new(RecordingStatusHandler::default());
        let builder = customize(ServerContext::builder_from_config(config).unwrap());
        let context = builder
            .clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .account_status_handlers(vec![
                Arc::clone(&status) as Arc<dyn AccountStatusNotificationHandler>
            ])
            .build()
            .unwrap();
        let backend = Arc::new(example_backend());
        context
            .backends()
            .register(Arc::clone(&backend) as Arc<dyn Backend>);
        let context = Arc::new(context);
        let pipeline = OperationPipeline::new(Arc::clone(&context));
        Self {
            context,
            pipeline,
            backend,
            clock,
            status,
            next_id: AtomicU64::new(1),
        }
    }

    /// a fresh operation record for the connection
    pub fn operation(
        &self,
        connection: &RecordingConnection,
        payload: OperationPayload,
    ) -> OperationRecord {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        OperationRecord::new(connection.connection_id(), id, id as i32, payload)
    }

    /// execute an operation and return the record and outcome
    pub fn run(
        &self,
        connection: &RecordingConnection,
        operation: OperationRecord,
    ) -> (OperationRecord, ExecutionOutcome) {
        let mut operation = operation;
        let outcome = self.pipeline.execute(&mut operation, connection);
        (operation, outcome)
    }

    /// execute a request without controls
    pub fn request(
        &self,
        connection: &RecordingConnection,
        payload: OperationPayload,
    ) -> (OperationRecord, ExecutionOutcome) {
        let operation = self.operation(connection, payload);
        self.run(connection, operation)
    }

    pub fn stored(&self, s: &str) -> Option<Entry> {
        self.backend.get_entry(&dn(s)).unwrap()
    }
}
