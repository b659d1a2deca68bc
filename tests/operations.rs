mod common;

use common::{dn, Fixture, RecordingConnection};
use ldap3::controls::RawControl;
use ldap3::{Mod, Scope};
use ldap_opcore::access::AccessControlHandler;
use ldap_opcore::backend::memory::MemoryBackend;
use ldap_opcore::backend::{Backend, WritabilityMode};
use ldap_opcore::connection::{DisconnectReason, Privilege};
use ldap_opcore::control::{
    noop_control, ResponseControl, ASSERTION_CONTROL_OID, POST_READ_CONTROL_OID,
    PRE_READ_CONTROL_OID, PROXIED_AUTH_V1_CONTROL_OID, PROXIED_AUTH_V2_CONTROL_OID,
};
use ldap_opcore::error::DirectoryError;
use ldap_opcore::lock::LockMode;
use ldap_opcore::notification::ChangeNotificationListener;
use ldap_opcore::operation::{OperationPayload, OperationType};
use ldap_opcore::plugin::{Plugin, PluginCheckpoint, PluginError, PluginResult};
use ldap_opcore::schema::{BasicSchema, SchemaChecker};
use ldap_opcore::{
    CancelRequest, CancelResult, Entry, ExecutionOutcome, OperationRecord, ResultCode,
    ServerConfig,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn control(oid: &str, critical: bool, value: Option<&str>) -> RawControl {
    RawControl {
        ctype: oid.to_string(),
        crit: critical,
        val: value.map(|v| v.as_bytes().to_vec()),
    }
}

fn attributes(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

#[test]
fn delete_of_entry_with_subordinate_backend_is_refused() {
    let fixture = Fixture::new();
    let staff = MemoryBackend::new("staff", vec![dn("ou=staff,ou=people,dc=example")]);
    staff.load(
        Entry::new(dn("ou=staff,ou=people,dc=example"))
            .with_attribute("objectClass", ["top", "organizationalUnit"])
            .with_attribute("ou", ["staff"]),
    );
    fixture
        .context
        .backends()
        .register(Arc::new(staff) as Arc<dyn Backend>);
    let connection = RecordingConnection::new(1);
    let (_, outcome) =
        fixture.request(&connection, OperationPayload::delete("ou=people,dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::NotAllowedOnNonleaf)
    );
    assert!(fixture.stored("ou=people,dc=example").is_some());
    assert_eq!(fixture.backend.mutation_count(), 0);
}

#[test]
fn delete_of_entry_with_children_is_refused() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(&connection, OperationPayload::delete("dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::NotAllowedOnNonleaf)
    );
}

#[test]
fn delete_of_leaf_entry() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_controls(vec![control(PRE_READ_CONTROL_OID, false, Some("cn"))]);
    let (operation, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    assert!(fixture.stored("cn=bob,dc=example").is_none());
    assert_eq!(fixture.backend.mutation_count(), 1);
    assert_eq!(
        operation.delete().unwrap().entry_to_delete.as_ref().unwrap().dn(),
        &dn("cn=bob,dc=example")
    );
    match connection.last_response().controls.as_slice() {
        [ResponseControl::PreRead(entry)] => {
            assert!(entry.has_value("cn", "bob"));
            assert!(!entry.has_attribute("sn"));
        }
        other => panic!("unexpected response controls {:?}", other),
    }
}

#[test]
fn delete_of_missing_entry_reports_matched_dn() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (operation, outcome) = fixture.request(
        &connection,
        OperationPayload::delete("cn=nobody,ou=people,dc=example"),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::NoSuchObject));
    assert_eq!(operation.matched_dn(), Some(&dn("ou=people,dc=example")));
}

#[test]
fn unsupported_critical_control_fails_the_delete() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_controls(vec![control("1.2.3.4.5", true, None)]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::UnavailableCriticalExtension)
    );
    assert!(fixture.stored("cn=bob,dc=example").is_some());
    assert_eq!(fixture.backend.mutation_count(), 0);

    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_controls(vec![control("1.2.3.4.5", false, None)]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
}

#[test]
fn critical_control_supported_by_the_backend_is_accepted() {
    let fixture = Fixture::new();
    let special =
        MemoryBackend::new("special", vec![dn("o=special")]).with_supported_control("1.2.3.4.5");
    special.load(
        Entry::new(dn("o=special"))
            .with_attribute("objectClass", ["top", "organization"])
            .with_attribute("o", ["special"]),
    );
    special.load(
        Entry::new(dn("cn=dev,o=special"))
            .with_attribute("objectClass", ["top", "device"])
            .with_attribute("cn", ["dev"]),
    );
    fixture
        .context
        .backends()
        .register(Arc::new(special) as Arc<dyn Backend>);
    let connection = RecordingConnection::new(1);
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=dev,o=special"))
        .with_controls(vec![control("1.2.3.4.5", true, None)]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
}

#[test]
fn rename_replaces_the_rdn_value() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (operation, outcome) = fixture.request(
        &connection,
        OperationPayload::modify_dn("cn=bob,dc=example", "cn=robert", true, None),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    assert!(fixture.stored("cn=bob,dc=example").is_none());
    let renamed = fixture.stored("cn=robert,dc=example").unwrap();
    assert!(renamed.has_value("cn", "robert"));
    assert!(!renamed.has_value("cn", "bob"));

    let payload = operation.modify_dn().unwrap();
    assert_eq!(payload.modifications.len(), 2);
    assert!(payload.modifications.iter().any(|m| matches!(
        m,
        Mod::Delete(attribute, values) if attribute == "cn" && values.contains("bob")
    )));
    assert!(payload.modifications.iter().any(|m| matches!(
        m,
        Mod::Add(attribute, values) if attribute == "cn" && values.contains("robert")
    )));
    let updated = payload.updated_entry.as_ref().unwrap();
    assert!(BasicSchema::standard().validate_entry(updated).is_ok());
    assert_eq!(fixture.backend.mutation_count(), 1);
}

#[test]
fn rename_that_breaks_the_schema_is_refused() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::modify_dn("uid=alice,dc=example", "cn=Alice Liddell", true, None),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::ObjectclassViolation)
    );
    assert!(fixture.stored("uid=alice,dc=example").is_some());
    assert_eq!(fixture.backend.mutation_count(), 0);
}

#[test]
fn rename_moves_below_new_superior() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::modify_dn(
            "cn=bob,dc=example",
            "cn=bob",
            false,
            Some("ou=people,dc=example"),
        ),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    assert!(fixture.stored("cn=bob,ou=people,dc=example").is_some());

    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::modify_dn(
            "ou=people,dc=example",
            "ou=people",
            false,
            Some("cn=bob,ou=people,dc=example"),
        ),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::UnwillingToPerform)
    );
}

#[test]
fn rename_onto_existing_entry_is_refused() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::modify_dn("cn=bob,dc=example", "uid=alice", false, None),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::EntryAlreadyExists)
    );
}

#[test]
fn add_checks_placement_and_schema() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let carol = attributes(&[
        ("objectClass", &["top", "person"]),
        ("sn", &["Carroll"]),
    ]);
    let operation = fixture
        .operation(
            &connection,
            OperationPayload::add("cn=carol,ou=people,dc=example", carol.clone()),
        )
        .with_controls(vec![control(POST_READ_CONTROL_OID, false, None)]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    let stored = fixture.stored("cn=carol,ou=people,dc=example").unwrap();
    assert!(stored.has_value("cn", "carol"));
    match connection.last_response().controls.as_slice() {
        [ResponseControl::PostRead(entry)] => assert!(entry.has_value("sn", "Carroll")),
        other => panic!("unexpected response controls {:?}", other),
    }

    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::add("cn=carol,ou=people,dc=example", carol.clone()),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::EntryAlreadyExists)
    );

    let (operation, outcome) = fixture.request(
        &connection,
        OperationPayload::add("cn=carol,ou=missing,dc=example", carol),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::NoSuchObject));
    assert_eq!(operation.matched_dn(), Some(&dn("dc=example")));

    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::add(
            "cn=dave,dc=example",
            attributes(&[("objectClass", &["top", "person"])]),
        ),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::ObjectclassViolation)
    );

    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::add(
            "cn=erin,dc=example",
            attributes(&[
                ("objectClass", &["top", "person"]),
                ("sn", &["E"]),
                ("createTimestamp", &["20240101000000Z"]),
            ]),
        ),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::ConstraintViolation)
    );
}

#[test]
fn add_outside_any_backend_fails() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::add(
            "cn=x,o=elsewhere",
            attributes(&[("objectClass", &["top", "device"])]),
        ),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::NoSuchObject));
}

#[test]
fn modify_applies_changes_and_read_controls() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let operation = fixture
        .operation(
            &connection,
            OperationPayload::modify(
                "cn=bob,dc=example",
                vec![Mod::Replace(
                    "sn".to_string(),
                    HashSet::from(["Marley".to_string()]),
                )],
            ),
        )
        .with_controls(vec![
            control(ASSERTION_CONTROL_OID, true, Some("(sn=Builder)")),
            control(PRE_READ_CONTROL_OID, false, Some("sn")),
            control(POST_READ_CONTROL_OID, false, Some("sn")),
        ]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    assert!(fixture
        .stored("cn=bob,dc=example")
        .unwrap()
        .has_value("sn", "Marley"));
    let controls = connection.last_response().controls;
    assert!(matches!(
        controls.as_slice(),
        [ResponseControl::PreRead(before), ResponseControl::PostRead(after)]
            if before.has_value("sn", "Builder") && after.has_value("sn", "Marley")
    ));
}

#[test]
fn modify_with_failing_assertion_changes_nothing() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let operation = fixture
        .operation(
            &connection,
            OperationPayload::modify(
                "cn=bob,dc=example",
                vec![Mod::Replace(
                    "sn".to_string(),
                    HashSet::from(["Marley".to_string()]),
                )],
            ),
        )
        .with_controls(vec![control(ASSERTION_CONTROL_OID, true, Some("(sn=Nobody)"))]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::AssertionFailed));
    assert_eq!(fixture.backend.mutation_count(), 0);
}

#[test]
fn modify_rejects_invalid_changes() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::modify(
            "cn=bob,dc=example",
            vec![Mod::Replace(
                "modifyTimestamp".to_string(),
                HashSet::from(["20240101000000Z".to_string()]),
            )],
        ),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::ConstraintViolation)
    );

    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::modify(
            "cn=bob,dc=example",
            vec![Mod::Delete("sn".to_string(), HashSet::new())],
        ),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::ObjectclassViolation)
    );
    assert_eq!(fixture.backend.mutation_count(), 0);
}

#[test]
fn no_op_control_skips_the_mutation() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_controls(vec![noop_control()]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::NoOperation));
    assert!(fixture.stored("cn=bob,dc=example").is_some());
    assert_eq!(fixture.backend.mutation_count(), 0);
}

#[test]
fn compare_results() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (operation, outcome) = fixture.request(
        &connection,
        OperationPayload::compare("cn=bob,dc=example", "sn", "builder"),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::CompareTrue));
    assert!(operation.compare().unwrap().entry.is_some());
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::compare("cn=bob,dc=example", "sn", "Marley"),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::CompareFalse));
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::compare("cn=bob,dc=example", "mail", "bob@example.com"),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::NoSuchAttribute)
    );
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::compare("cn=nobody,dc=example", "sn", "x"),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::NoSuchObject));
}

fn person_search(attributes: Vec<String>) -> OperationPayload {
    OperationPayload::search("dc=example", Scope::Subtree, "(objectClass=person)", attributes)
}

#[test]
fn search_returns_matching_entries() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (operation, outcome) =
        fixture.request(&connection, person_search(vec!["sn".to_string()]));
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    let entries = connection.search_entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.has_attribute("sn") && !e.has_attribute("cn")));
    assert_eq!(operation.search().unwrap().entries_sent, 2);
}

#[test]
fn search_size_limit() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let mut operation = fixture.operation(&connection, person_search(Vec::new()));
    operation.search_mut().unwrap().size_limit = 1;
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::SizeLimitExceeded)
    );
    assert_eq!(connection.search_entries().len(), 1);
}

#[test]
fn search_stops_when_the_client_stops_reading() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1).accepting_entries(1);
    let (operation, _) = fixture.request(&connection, person_search(Vec::new()));
    assert_eq!(operation.search().unwrap().entries_sent, 1);
}

#[test]
fn search_request_errors() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::search("dc=example", Scope::Subtree, "(objectClass=person", Vec::new()),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::ProtocolError));
    let (operation, outcome) = fixture.request(
        &connection,
        OperationPayload::search(
            "ou=missing,dc=example",
            Scope::Subtree,
            "(objectClass=*)",
            Vec::new(),
        ),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::NoSuchObject));
    assert_eq!(operation.matched_dn(), Some(&dn("dc=example")));
}

#[test]
fn writability_is_enforced() {
    let fixture = Fixture::new();
    fixture.backend.set_writability_mode(WritabilityMode::InternalOnly);
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::UnwillingToPerform)
    );
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_internal(true);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));

    let fixture = Fixture::with_config(ServerConfig {
        writability_mode: WritabilityMode::Disabled,
        ..ServerConfig::default()
    });
    let (_, outcome) = fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::UnwillingToPerform)
    );
}

/// denies everything to everyone
#[derive(Debug)]
struct DenyAll;

impl AccessControlHandler for DenyAll {
    fn is_allowed(&self, _operation: &OperationRecord) -> bool {
        false
    }

    fn is_proxied_auth_allowed(&self, _operation: &OperationRecord, _proxy_entry: &Entry) -> bool {
        false
    }
}

#[test]
fn access_control_denies_external_operations() {
    let fixture = Fixture::customized(ServerConfig::default(), |builder| {
        builder.access_control(Arc::new(DenyAll) as Arc<dyn AccessControlHandler>)
    });
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::InsufficientAccessRights)
    );
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_internal(true);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
}

/// allows operations authorized as alice only
#[derive(Debug)]
struct OnlyAlice;

impl AccessControlHandler for OnlyAlice {
    fn is_allowed(&self, operation: &OperationRecord) -> bool {
        operation.authorization_dn() == Some(&dn("uid=alice,dc=example"))
    }

    fn is_proxied_auth_allowed(&self, _operation: &OperationRecord, _proxy_entry: &Entry) -> bool {
        true
    }
}

fn only_alice() -> Fixture {
    Fixture::customized(ServerConfig::default(), |builder| {
        builder.access_control(Arc::new(OnlyAlice) as Arc<dyn AccessControlHandler>)
    })
}

fn proxy_connection() -> RecordingConnection {
    let connection = RecordingConnection::new(1);
    connection.authenticate_as(dn("cn=proxy,dc=example"));
    connection
}

#[test]
fn access_control_evaluates_the_proxied_identity() {
    let fixture = only_alice();
    let connection = proxy_connection();
    connection.grant(Privilege::ProxiedAuth);

    let (_, outcome) = fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::InsufficientAccessRights)
    );

    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_controls(vec![control(
            PROXIED_AUTH_V1_CONTROL_OID,
            true,
            Some("uid=alice,dc=example"),
        )]);
    let (operation, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    assert_eq!(
        operation.authorization_dn(),
        Some(&dn("uid=alice,dc=example"))
    );
    assert!(fixture.stored("cn=bob,dc=example").is_none());
}

#[test]
fn proxied_auth_v2_finds_users_by_name() {
    let fixture = only_alice();
    let connection = proxy_connection();
    connection.grant(Privilege::ProxiedAuth);
    let operation = fixture
        .operation(
            &connection,
            OperationPayload::compare("cn=bob,dc=example", "sn", "Builder"),
        )
        .with_controls(vec![control(PROXIED_AUTH_V2_CONTROL_OID, true, Some("u:alice"))]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::CompareTrue));

    let operation = fixture
        .operation(
            &connection,
            OperationPayload::search("dc=example", Scope::Subtree, "(cn=bob)", Vec::new()),
        )
        .with_controls(vec![control(
            PROXIED_AUTH_V2_CONTROL_OID,
            true,
            Some("dn:uid=alice,dc=example"),
        )]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    assert_eq!(connection.search_entries().len(), 1);
}

#[test]
fn proxied_auth_requires_the_privilege() {
    let fixture = only_alice();
    let connection = proxy_connection();
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_controls(vec![control(
            PROXIED_AUTH_V1_CONTROL_OID,
            true,
            Some("uid=alice,dc=example"),
        )]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::AuthorizationDenied)
    );
    assert!(connection
        .last_response()
        .error_message
        .contains("privileges"));
    assert!(fixture.stored("cn=bob,dc=example").is_some());
}

#[test]
fn proxied_auth_to_a_missing_entry_is_denied() {
    let fixture = only_alice();
    let connection = proxy_connection();
    connection.grant(Privilege::ProxiedAuth);
    let operation = fixture
        .operation(&connection, OperationPayload::delete("cn=bob,dc=example"))
        .with_controls(vec![control(
            PROXIED_AUTH_V1_CONTROL_OID,
            true,
            Some("uid=nobody,dc=example"),
        )]);
    let (_, outcome) = fixture.run(&connection, operation);
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::AuthorizationDenied)
    );
    assert!(connection
        .last_response()
        .error_message
        .contains("existing entry"));
    assert!(fixture.stored("cn=bob,dc=example").is_some());
}

/// a plugin with a scripted answer at one checkpoint
#[derive(Debug)]
struct ScriptedPlugin {
    checkpoint: PluginCheckpoint,
    operation_type: OperationType,
    result: PluginResult,
    calls: AtomicUsize,
}

impl ScriptedPlugin {
    fn new(
        checkpoint: PluginCheckpoint,
        operation_type: OperationType,
        result: PluginResult,
    ) -> Arc<Self> {
        Arc::new(Self {
            checkpoint,
            operation_type,
            result,
            calls: AtomicUsize::new(0),
        })
    }

    fn answer(&self, operation: &mut OperationRecord) -> Result<PluginResult, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.result == PluginResult::SendResponseImmediately {
            operation.set_result_code(ResultCode::UnwillingToPerform);
            operation.append_error_message("Refused by plugin");
        }
        Ok(self.result.clone())
    }
}

impl Plugin for ScriptedPlugin {
    fn id(&self) -> &str {
        "scripted"
    }

    fn checkpoints(&self) -> Vec<PluginCheckpoint> {
        vec![self.checkpoint]
    }

    fn operation_types(&self) -> Vec<OperationType> {
        vec![self.operation_type]
    }

    fn pre_parse(&self, operation: &mut OperationRecord) -> Result<PluginResult, PluginError> {
        self.answer(operation)
    }

    fn pre_operation(&self, operation: &mut OperationRecord) -> Result<PluginResult, PluginError> {
        self.answer(operation)
    }

    fn post_operation(&self, operation: &mut OperationRecord) -> Result<PluginResult, PluginError> {
        self.answer(operation)
    }

    fn post_response(&self, _operation: &OperationRecord) -> Result<PluginResult, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

#[test]
fn pre_parse_plugin_answers_immediately() {
    let fixture = Fixture::new();
    let plugin = ScriptedPlugin::new(
        PluginCheckpoint::PreParse,
        OperationType::Delete,
        PluginResult::SendResponseImmediately,
    );
    fixture.context.plugins().register(plugin.clone());
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::UnwillingToPerform)
    );
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    assert_eq!(connection.last_response().error_message, "Refused by plugin");
    assert!(fixture.stored("cn=bob,dc=example").is_some());
}

#[test]
fn pre_operation_plugin_terminates_the_connection() {
    let fixture = Fixture::new();
    fixture.context.plugins().register(ScriptedPlugin::new(
        PluginCheckpoint::PreOperation,
        OperationType::Delete,
        PluginResult::TerminateConnection {
            message: "go away".to_string(),
        },
    ));
    let connection = RecordingConnection::new(1);
    let (operation, outcome) =
        fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(
        outcome,
        ExecutionOutcome::Disconnected {
            message: "go away".to_string()
        }
    );
    assert_eq!(operation.result_code(), Some(ResultCode::Canceled));
    assert_eq!(
        connection.disconnects(),
        vec![(DisconnectReason::PluginTerminated, "go away".to_string())]
    );
    assert!(connection.responses().is_empty());
    assert_eq!(fixture.backend.mutation_count(), 0);
    assert!(!fixture
        .context
        .lock_manager()
        .is_locked(&dn("cn=bob,dc=example")));
}

#[test]
fn pre_operation_plugins_run_for_reads() {
    let fixture = Fixture::new();
    let compare = ScriptedPlugin::new(
        PluginCheckpoint::PreOperation,
        OperationType::Compare,
        PluginResult::Continue,
    );
    let search = ScriptedPlugin::new(
        PluginCheckpoint::PreOperation,
        OperationType::Search,
        PluginResult::SendResponseImmediately,
    );
    fixture.context.plugins().register(compare.clone());
    fixture.context.plugins().register(search.clone());
    let connection = RecordingConnection::new(1);

    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::compare("cn=bob,dc=example", "sn", "Builder"),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::CompareTrue));
    assert_eq!(compare.calls.load(Ordering::SeqCst), 1);

    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::search("dc=example", Scope::Subtree, "(objectClass=*)", Vec::new()),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed(ResultCode::UnwillingToPerform)
    );
    assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    assert!(connection.search_entries().is_empty());
}

#[test]
fn pre_parse_termination_is_logged() {
    let fixture = Fixture::new();
    fixture.context.plugins().register(ScriptedPlugin::new(
        PluginCheckpoint::PreParse,
        OperationType::Delete,
        PluginResult::TerminateConnection {
            message: "go away".to_string(),
        },
    ));
    let connection = RecordingConnection::new(1);
    let log = CapturedLog::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
        .with_ansi(false)
        .with_writer(log.clone())
        .finish();
    let (_, outcome) = tracing::subscriber::with_default(subscriber, || {
        fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"))
    });
    assert!(matches!(outcome, ExecutionOutcome::Disconnected { .. }));
    let lines = log.contents();
    assert!(lines.contains("DELETE REQ dn=\"cn=bob,dc=example\""));
    assert!(lines.contains("DELETE DISCONNECT reason=\"go away\""));
}

/// collects formatted log output in memory
#[derive(Debug, Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
    type Writer = CapturedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn post_response_plugins_see_finished_operations() {
    let fixture = Fixture::new();
    let plugin = ScriptedPlugin::new(
        PluginCheckpoint::PostResponse,
        OperationType::Compare,
        PluginResult::Continue,
    );
    fixture.context.plugins().register(plugin.clone());
    let connection = RecordingConnection::new(1);
    fixture.request(
        &connection,
        OperationPayload::compare("cn=bob,dc=example", "sn", "Builder"),
    );
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
}

/// adds a description to every modify
#[derive(Debug)]
struct Stamp;

impl Plugin for Stamp {
    fn id(&self) -> &str {
        "stamp"
    }

    fn checkpoints(&self) -> Vec<PluginCheckpoint> {
        vec![PluginCheckpoint::PreOperation]
    }

    fn operation_types(&self) -> Vec<OperationType> {
        vec![OperationType::Modify]
    }

    fn pre_operation(&self, operation: &mut OperationRecord) -> Result<PluginResult, PluginError> {
        let payload = operation
            .modify_mut()
            .ok_or_else(|| PluginError::Failed("not a modify".to_string()))?;
        payload.modifications.push(Mod::Replace(
            "description".to_string(),
            HashSet::from(["stamped".to_string()]),
        ));
        Ok(PluginResult::Continue)
    }
}

#[test]
fn pre_operation_plugin_modifications_are_applied() {
    let fixture = Fixture::new();
    fixture.context.plugins().register(Arc::new(Stamp));
    let connection = RecordingConnection::new(1);
    let (_, outcome) = fixture.request(
        &connection,
        OperationPayload::modify(
            "cn=bob,dc=example",
            vec![Mod::Add(
                "telephoneNumber".to_string(),
                HashSet::from(["+1 555 0100".to_string()]),
            )],
        ),
    );
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    let bob = fixture.stored("cn=bob,dc=example").unwrap();
    assert!(bob.has_value("description", "stamped"));
    assert!(bob.has_value("telephoneNumber", "+1 555 0100"));
}

/// remembers the changes it was told about
#[derive(Debug, Default)]
struct Listener {
    changes: Mutex<Vec<String>>,
}

impl ChangeNotificationListener for Listener {
    fn id(&self) -> &str {
        "listener"
    }

    fn handle_add_operation(
        &self,
        _operation: &OperationRecord,
        entry: &Entry,
    ) -> Result<(), DirectoryError> {
        self.changes.lock().unwrap().push(format!("add {}", entry.dn()));
        Ok(())
    }

    fn handle_delete_operation(
        &self,
        _operation: &OperationRecord,
        entry: &Entry,
    ) -> Result<(), DirectoryError> {
        self.changes
            .lock()
            .unwrap()
            .push(format!("delete {}", entry.dn()));
        Ok(())
    }
}

#[test]
fn listeners_hear_about_successful_changes_only() {
    let fixture = Fixture::new();
    let listener = Arc::new(Listener::default());
    fixture
        .context
        .notifications()
        .register_listener(listener.clone());
    let connection = RecordingConnection::new(1);
    fixture.request(&connection, OperationPayload::delete("dc=example"));
    fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    let changes = listener.changes.lock().unwrap().clone();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].starts_with("delete "));
}

#[test]
fn canceled_operation_stops_before_the_backend() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let operation = fixture.operation(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(
        operation
            .cancel_state()
            .request_cancel(CancelRequest::new(true, "Abandoned by the client")),
        None
    );
    let (operation, outcome) = fixture.run(&connection, operation);
    assert_eq!(outcome, ExecutionOutcome::Canceled);
    assert_eq!(operation.result_code(), Some(ResultCode::Canceled));
    assert_eq!(
        operation.cancel_state().result(),
        Some(CancelResult::Canceled)
    );
    assert_eq!(
        connection.last_response().result_code,
        Some(ResultCode::Canceled)
    );
    assert!(fixture.stored("cn=bob,dc=example").is_some());

    let quiet = RecordingConnection::new(2);
    let operation = fixture.operation(&quiet, OperationPayload::delete("cn=bob,dc=example"));
    operation
        .cancel_state()
        .request_cancel(CancelRequest::new(false, "Abandoned"));
    let (_, outcome) = fixture.run(&quiet, operation);
    assert_eq!(outcome, ExecutionOutcome::Canceled);
    assert!(quiet.responses().is_empty());
}

#[test]
fn finished_update_is_too_late_to_cancel() {
    let fixture = Fixture::new();
    let connection = RecordingConnection::new(1);
    let (operation, outcome) =
        fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Success));
    assert_eq!(
        operation
            .cancel_state()
            .request_cancel(CancelRequest::new(true, "late")),
        Some(CancelResult::TooLate)
    );
}

#[test]
fn held_entry_lock_fails_the_operation() {
    let fixture = Fixture::with_config(ServerConfig {
        lock_attempts: 2,
        lock_attempt_timeout_ms: 10,
        ..ServerConfig::default()
    });
    let bob = dn("cn=bob,dc=example");
    let _held = fixture
        .context
        .lock_manager()
        .acquire(&bob, LockMode::Write)
        .unwrap();
    let connection = RecordingConnection::new(1);
    let (operation, outcome) =
        fixture.request(&connection, OperationPayload::delete("cn=bob,dc=example"));
    assert_eq!(outcome, ExecutionOutcome::Completed(ResultCode::Other));
    assert!(operation.error_message().contains("lock"));
    assert!(fixture.stored("cn=bob,dc=example").is_some());
}
