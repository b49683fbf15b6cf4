// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! End-to-end behaviour of the four-step rotation against an in-memory store
//! and a simulated fleet. The simulated executor only authenticates a private
//! key whose public half is currently installed on the target host.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sshrotate_core::application::{RotationOrchestrator, RotationSettings};
use sshrotate_core::domain::fleet::{
    CommandId, CommandState, CommandStatus, FleetCommandDispatcher, FleetError, FleetSelector,
    KeyAction, TargetOutcome, TargetResult,
};
use sshrotate_core::domain::keygen::{KeyGenerationError, KeyPair, KeyPairGenerator};
use sshrotate_core::domain::remote::{RemoteError, RemoteExecutor, RemoteOutput};
use sshrotate_core::domain::rotation::{RotationErrorKind, RotationRequest, RotationStep};
use sshrotate_core::domain::secret::{
    CredentialMaterial, SecretId, SecretStore, SecretStoreError, StageLabel, VersionId,
};
use sshrotate_core::infrastructure::secret_store::InMemorySecretStore;

/// Hosts and the keys installed on them, keyed by version token
#[derive(Default)]
struct SimulatedFleet {
    hosts: Mutex<BTreeMap<String, BTreeMap<VersionId, String>>>,
    key_pairs: Mutex<HashMap<String, String>>,
    issued: Mutex<Vec<KeyAction>>,
    unreachable: Mutex<HashSet<String>>,
    hang: AtomicBool,
}

impl SimulatedFleet {
    fn with_hosts(addresses: &[&str]) -> Arc<Self> {
        let fleet = Self::default();
        {
            let mut hosts = fleet.hosts.lock();
            for address in addresses {
                hosts.insert(address.to_string(), BTreeMap::new());
            }
        }
        Arc::new(fleet)
    }

    fn install_everywhere(&self, version: &VersionId, public_key: &str) {
        for keys in self.hosts.lock().values_mut() {
            keys.insert(version.clone(), public_key.to_string());
        }
    }

    fn versions_on(&self, address: &str) -> Vec<VersionId> {
        self.hosts.lock()[address].keys().cloned().collect()
    }

    fn issued(&self) -> Vec<KeyAction> {
        self.issued.lock().clone()
    }

    fn removals(&self) -> usize {
        self.issued()
            .iter()
            .filter(|action| matches!(action, KeyAction::RemoveKey { .. }))
            .count()
    }
}

struct SimulatedDispatcher {
    fleet: Arc<SimulatedFleet>,
    statuses: Mutex<HashMap<CommandId, CommandStatus>>,
}

#[async_trait]
impl FleetCommandDispatcher for SimulatedDispatcher {
    async fn issue(&self, _selector: &FleetSelector, action: KeyAction) -> Result<CommandId, FleetError> {
        self.fleet.issued.lock().push(action.clone());
        let unreachable = self.fleet.unreachable.lock().clone();

        let mut targets = Vec::new();
        for (address, keys) in self.fleet.hosts.lock().iter_mut() {
            let outcome = if unreachable.contains(address) {
                TargetOutcome::Failed("Connection timed out".to_string())
            } else {
                match &action {
                    KeyAction::AddKey { version, public_key } => {
                        keys.insert(version.clone(), public_key.clone());
                    }
                    KeyAction::RemoveKey { version } => {
                        keys.remove(version);
                    }
                }
                TargetOutcome::Success
            };
            targets.push(TargetResult {
                address: address.clone(),
                outcome,
                finished_at: Utc::now(),
            });
        }

        let state = if targets.iter().all(|t| t.outcome == TargetOutcome::Success) {
            CommandState::Success
        } else {
            CommandState::Failed
        };
        let command_id = CommandId::new();
        self.statuses.lock().insert(
            command_id,
            CommandStatus {
                command_id,
                state,
                targets,
            },
        );
        Ok(command_id)
    }

    async fn await_completion(&self, command_id: &CommandId) -> Result<CommandStatus, FleetError> {
        if self.fleet.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.statuses
            .lock()
            .get(command_id)
            .cloned()
            .ok_or(FleetError::UnknownCommand(*command_id))
    }

    async fn resolve_addresses(
        &self,
        _selector: &FleetSelector,
        _version: &VersionId,
    ) -> Result<Vec<String>, FleetError> {
        Ok(self.fleet.hosts.lock().keys().cloned().collect())
    }
}

struct SimulatedExecutor {
    fleet: Arc<SimulatedFleet>,
}

#[async_trait]
impl RemoteExecutor for SimulatedExecutor {
    async fn run(
        &self,
        address: &str,
        username: &str,
        private_key: &str,
        _command: &str,
    ) -> Result<RemoteOutput, RemoteError> {
        let public_key = self.fleet.key_pairs.lock().get(private_key).cloned();
        let hosts = self.fleet.hosts.lock();
        let keys = hosts.get(address).ok_or_else(|| RemoteError::Unreachable {
            address: address.to_string(),
            detail: "no route to host".to_string(),
        })?;

        match public_key {
            Some(public_key) if keys.values().any(|k| *k == public_key) => Ok(RemoteOutput {
                stdout: format!("{}\n", address),
                stderr: String::new(),
                exit_code: 0,
            }),
            _ => Err(RemoteError::AuthenticationFailed {
                address: address.to_string(),
                username: username.to_string(),
                detail: "Permission denied (publickey).".to_string(),
            }),
        }
    }
}

struct CountingGenerator {
    fleet: Arc<SimulatedFleet>,
    calls: AtomicUsize,
}

impl KeyPairGenerator for CountingGenerator {
    fn generate(&self, seed: &str) -> Result<KeyPair, KeyGenerationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let private_key = format!("PRIVATE-{}-{}", seed, n);
        let public_key = format!(
            "ssh-ed25519 {} sshrotate-version={}",
            STANDARD.encode(format!("key-{}-{}", seed, n)),
            seed
        );
        self.fleet
            .key_pairs
            .lock()
            .insert(private_key.clone(), public_key.clone());
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }
}

struct Harness {
    store: InMemorySecretStore,
    fleet: Arc<SimulatedFleet>,
    generator: Arc<CountingGenerator>,
    orchestrator: Arc<RotationOrchestrator>,
    secret: SecretId,
}

const HOSTS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];

impl Harness {
    /// Secret with version `v0` as CURRENT, its key installed on every host
    async fn with_current_key(addresses: &[&str]) -> Self {
        let harness = Self::empty(addresses, RotationSettings::new(selector(), "ec2-user"));
        let v0 = VersionId::new("v0");
        let material = harness.generator.generate("v0").unwrap().into_material();
        harness
            .store
            .put_value(
                &harness.secret,
                &v0,
                &material.to_payload().unwrap(),
                &[StageLabel::Current],
            )
            .await
            .unwrap();
        harness.fleet.install_everywhere(&v0, &material.public_key);
        harness.generator.calls.store(0, Ordering::SeqCst);
        harness
    }

    fn empty(addresses: &[&str], settings: RotationSettings) -> Self {
        let fleet = SimulatedFleet::with_hosts(addresses);
        let store = InMemorySecretStore::new();
        let secret = SecretId::new("arn:secret:bastion-ssh");
        store.create_secret(&secret, true).unwrap();

        let generator = Arc::new(CountingGenerator {
            fleet: fleet.clone(),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = RotationOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(SimulatedDispatcher {
                fleet: fleet.clone(),
                statuses: Mutex::new(HashMap::new()),
            }),
            generator.clone(),
            Arc::new(SimulatedExecutor {
                fleet: fleet.clone(),
            }),
            settings,
        );

        Self {
            store,
            fleet,
            generator,
            orchestrator: Arc::new(orchestrator),
            secret,
        }
    }

    fn begin(&self, token: &str) -> VersionId {
        let token = VersionId::new(token);
        self.store.begin_rotation(&self.secret, &token).unwrap();
        token
    }

    fn request(&self, token: &VersionId, step: RotationStep) -> RotationRequest {
        RotationRequest::new(self.secret.clone(), token.clone(), step)
    }

    async fn step(&self, token: &VersionId, step: RotationStep) -> Result<(), RotationErrorKind> {
        self.orchestrator
            .handle_step(&self.request(token, step))
            .await
            .map_err(|e| e.kind)
    }

    async fn labels(&self) -> BTreeMap<VersionId, Vec<String>> {
        self.store
            .describe(&self.secret)
            .await
            .unwrap()
            .versions
            .into_iter()
            .map(|(version, stages)| (version, stages.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    async fn current(&self) -> Option<VersionId> {
        self.store
            .describe(&self.secret)
            .await
            .unwrap()
            .version_with(&StageLabel::Current)
            .cloned()
    }
}

fn selector() -> FleetSelector {
    FleetSelector::new("Role", "bastion")
}

#[tokio::test]
async fn test_full_rotation_promotes_token_and_retires_prior_key() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");

    h.orchestrator.rotate(&h.secret, &t1).await.unwrap();

    assert_eq!(h.current().await, Some(t1.clone()));
    let labels = h.labels().await;
    assert_eq!(labels[&VersionId::new("v0")], vec!["PREVIOUS"]);
    assert_eq!(labels[&t1], vec!["CURRENT"]);

    for address in HOSTS {
        assert_eq!(h.fleet.versions_on(address), vec![t1.clone()]);
    }

    let issued = h.fleet.issued();
    assert_eq!(issued.len(), 2);
    assert!(matches!(&issued[0], KeyAction::AddKey { version, .. } if *version == t1));
    assert_eq!(
        issued[1],
        KeyAction::RemoveKey {
            version: VersionId::new("v0")
        }
    );
}

#[tokio::test]
async fn test_create_secret_generates_only_once_per_token() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");

    h.step(&t1, RotationStep::CreateSecret).await.unwrap();
    let first = h
        .store
        .get_value(&h.secret, &StageLabel::Pending, Some(&t1))
        .await
        .unwrap();

    h.step(&t1, RotationStep::CreateSecret).await.unwrap();
    let second = h
        .store
        .get_value(&h.secret, &StageLabel::Pending, Some(&t1))
        .await
        .unwrap();

    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.payload, second.payload);
    let material = CredentialMaterial::from_payload(&first.payload).unwrap();
    assert!(material.public_key.ends_with("sshrotate-version=t1"));
}

#[tokio::test]
async fn test_repeating_each_step_converges_on_same_state() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");

    for step in RotationStep::ALL {
        h.step(&t1, step).await.unwrap();
        h.step(&t1, step).await.unwrap();
    }

    assert_eq!(h.current().await, Some(t1.clone()));
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    for address in HOSTS {
        assert_eq!(h.fleet.versions_on(address), vec![t1.clone()]);
    }

    // Every step of a finished rotation is a no-op
    let issued_before = h.fleet.issued().len();
    let labels_before = h.labels().await;
    for step in RotationStep::ALL {
        h.step(&t1, step).await.unwrap();
    }
    assert_eq!(h.fleet.issued().len(), issued_before);
    assert_eq!(h.labels().await, labels_before);
}

#[tokio::test]
async fn test_preconditions_reject_without_side_effects() {
    let h = Harness::with_current_key(&HOSTS).await;

    let err = h
        .step(&VersionId::new("never-staged"), RotationStep::CreateSecret)
        .await
        .unwrap_err();
    assert!(matches!(err, RotationErrorKind::UnknownVersion));

    let t1 = h.begin("t1");
    h.orchestrator.rotate(&h.secret, &t1).await.unwrap();
    let err = h
        .step(&VersionId::new("v0"), RotationStep::SetSecret)
        .await
        .unwrap_err();
    assert!(matches!(err, RotationErrorKind::NotPending { ref stages } if stages == &vec!["PREVIOUS".to_string()]));

    let t2 = h.begin("t2");
    h.store.set_rotation_enabled(&h.secret, false).unwrap();
    let issued_before = h.fleet.issued().len();
    let err = h.step(&t2, RotationStep::CreateSecret).await.unwrap_err();
    assert!(matches!(err, RotationErrorKind::RotationNotEnabled));
    assert_eq!(h.fleet.issued().len(), issued_before);
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_one_rejecting_host_fails_test_secret() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    h.step(&t1, RotationStep::CreateSecret).await.unwrap();
    h.step(&t1, RotationStep::SetSecret).await.unwrap();

    // Key drifted away on one host after setSecret
    h.fleet.hosts.lock().get_mut("10.0.0.2").unwrap().remove(&t1);
    let labels_before = h.labels().await;

    let err = h.step(&t1, RotationStep::TestSecret).await.unwrap_err();
    match err {
        RotationErrorKind::CredentialVerificationFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].address, "10.0.0.2");
            assert!(failures[0].reason.contains("Permission denied"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.labels().await, labels_before);

    // Re-running setSecret repairs the host
    h.step(&t1, RotationStep::SetSecret).await.unwrap();
    h.step(&t1, RotationStep::TestSecret).await.unwrap();
}

#[tokio::test]
async fn test_set_secret_surfaces_failed_targets() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    h.step(&t1, RotationStep::CreateSecret).await.unwrap();
    h.fleet.unreachable.lock().insert("10.0.0.3".to_string());

    let err = h
        .orchestrator
        .handle_step(&h.request(&t1, RotationStep::SetSecret))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    match err.kind {
        RotationErrorKind::FleetCommandFailed { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].address, "10.0.0.3");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_empty_fleet_fails_unless_allowed() {
    let h = Harness::empty(&[], RotationSettings::new(selector(), "ec2-user"));
    let t1 = h.begin("t1");
    h.step(&t1, RotationStep::CreateSecret).await.unwrap();
    h.step(&t1, RotationStep::SetSecret).await.unwrap();
    let err = h.step(&t1, RotationStep::TestSecret).await.unwrap_err();
    assert!(matches!(err, RotationErrorKind::CredentialVerificationFailed { .. }));

    let mut settings = RotationSettings::new(selector(), "ec2-user");
    settings.allow_empty_fleet = true;
    let h = Harness::empty(&[], settings);
    let t1 = h.begin("t1");
    h.orchestrator.rotate(&h.secret, &t1).await.unwrap();
    assert_eq!(h.current().await, Some(t1));
}

#[tokio::test]
async fn test_first_rotation_has_no_stale_key_to_remove() {
    let h = Harness::empty(&HOSTS, RotationSettings::new(selector(), "ec2-user"));
    let t1 = h.begin("t1");

    h.orchestrator.rotate(&h.secret, &t1).await.unwrap();

    assert_eq!(h.current().await, Some(t1));
    assert_eq!(h.fleet.removals(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_command_that_never_completes_times_out() {
    let mut settings = RotationSettings::new(selector(), "ec2-user");
    settings.command_timeout = Duration::from_secs(600);
    let h = Harness::empty(&HOSTS, settings);
    let t1 = h.begin("t1");
    h.step(&t1, RotationStep::CreateSecret).await.unwrap();

    h.fleet.hang.store(true, Ordering::SeqCst);
    let labels_before = h.labels().await;

    let err = h.step(&t1, RotationStep::SetSecret).await.unwrap_err();
    match err {
        RotationErrorKind::CommandTimeout { waited, .. } => {
            assert_eq!(waited, Duration::from_secs(600));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.labels().await, labels_before);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_wait() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    h.step(&t1, RotationStep::CreateSecret).await.unwrap();

    h.fleet.hang.store(true, Ordering::SeqCst);
    h.orchestrator.shutdown_token().cancel();

    let err = h.step(&t1, RotationStep::SetSecret).await.unwrap_err();
    assert!(matches!(err, RotationErrorKind::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_finish_leaves_exactly_one_current() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    for step in [
        RotationStep::CreateSecret,
        RotationStep::SetSecret,
        RotationStep::TestSecret,
    ] {
        h.step(&t1, step).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        let request = h.request(&t1, RotationStep::FinishSecret);
        handles.push(tokio::spawn(async move {
            orchestrator.handle_step(&request).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let description = h.store.describe(&h.secret).await.unwrap();
    assert_eq!(description.holders_of(&StageLabel::Current), 1);
    assert_eq!(description.version_with(&StageLabel::Current), Some(&t1));
    assert_eq!(h.fleet.removals(), 1);
}

#[tokio::test]
async fn test_failed_cleanup_keeps_promotion_and_can_be_rerun() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    for step in [
        RotationStep::CreateSecret,
        RotationStep::SetSecret,
        RotationStep::TestSecret,
    ] {
        h.step(&t1, step).await.unwrap();
    }

    h.fleet.unreachable.lock().insert("10.0.0.1".to_string());
    let err = h.step(&t1, RotationStep::FinishSecret).await.unwrap_err();
    assert!(matches!(
        err,
        RotationErrorKind::StaleKeyCleanupFailed { ref prior_version, .. } if prior_version == &VersionId::new("v0")
    ));
    assert_eq!(h.current().await, Some(t1.clone()));
    assert!(h.fleet.versions_on("10.0.0.1").contains(&VersionId::new("v0")));

    h.fleet.unreachable.lock().clear();
    let cleaned = h.orchestrator.cleanup_previous(&h.secret).await.unwrap();
    assert_eq!(cleaned, Some(VersionId::new("v0")));
    assert_eq!(h.fleet.versions_on("10.0.0.1"), vec![t1]);
}

#[tokio::test]
async fn test_malformed_pending_value_is_reported() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    h.store
        .put_value(&h.secret, &t1, "not json", &[StageLabel::Pending])
        .await
        .unwrap();

    let err = h.step(&t1, RotationStep::SetSecret).await.unwrap_err();
    assert!(matches!(err, RotationErrorKind::MalformedSecret(_)));
    assert!(h.fleet.issued().is_empty());
}

#[tokio::test]
async fn test_unreadable_current_after_promotion_still_removes_prior_key() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    h.store
        .put_value(&h.secret, &t1, "not json", &[StageLabel::Pending])
        .await
        .unwrap();

    let err = h.step(&t1, RotationStep::FinishSecret).await.unwrap_err();
    assert!(matches!(err, RotationErrorKind::MalformedSecret(_)));
    assert_eq!(h.current().await, Some(t1.clone()));
    assert_eq!(h.fleet.removals(), 1);
    assert!(!h.fleet.versions_on("10.0.0.1").contains(&VersionId::new("v0")));

    // Retry short-circuits on CURRENT
    h.step(&t1, RotationStep::FinishSecret).await.unwrap();
    assert_eq!(h.fleet.removals(), 1);
}

#[tokio::test]
async fn test_abandoned_pending_key_can_be_removed_explicitly() {
    let h = Harness::with_current_key(&HOSTS).await;
    let t1 = h.begin("t1");
    h.step(&t1, RotationStep::CreateSecret).await.unwrap();
    h.step(&t1, RotationStep::SetSecret).await.unwrap();

    // A new rotation takes over PENDING before t1 finishes
    let t2 = h.begin("t2");
    assert!(h.fleet.versions_on("10.0.0.2").contains(&t1));

    let err = h.orchestrator.cleanup_version(&h.secret, &t2).await.unwrap_err();
    assert!(matches!(err, RotationErrorKind::SecretStore(SecretStoreError::InvalidRequest(_))));
    let err = h
        .orchestrator
        .cleanup_version(&h.secret, &VersionId::new("v0"))
        .await
        .unwrap_err();
    assert!(matches!(err, RotationErrorKind::SecretStore(SecretStoreError::InvalidRequest(_))));
    let err = h
        .orchestrator
        .cleanup_version(&h.secret, &VersionId::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, RotationErrorKind::UnknownVersion));

    h.orchestrator.cleanup_version(&h.secret, &t1).await.unwrap();
    for address in HOSTS {
        assert_eq!(h.fleet.versions_on(address), vec![VersionId::new("v0")]);
    }
}
