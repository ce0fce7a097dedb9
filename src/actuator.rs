//! Machine lifecycle actuation against the instance provider.
//!
//! The [`Actuator`] wraps the pure decision core in [`crate::machine`]
//! with the provider calls those decisions trigger. It exposes the
//! four-operation lifecycle surface the controller drives (`exists`,
//! `create`, `update`, `delete`) plus an `observed` snapshot for status
//! reporting.
//!
//! Provider mutations are serialized per machine identity: a create or
//! recreate holds an in-flight key for its `(namespace, name)` pair, so
//! two passes can never race a launch for the same logical machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::crd::Machine;
use crate::machine::{control_plane_machines, immutable_drift, machines_equal, plan, MachineOp};
use crate::provider::{Instance, InstanceService};
use crate::{Error, Result, MACHINE_NAME_TAG, MACHINE_NAMESPACE_TAG};

/// Read-only source of the desired-state machine collection
///
/// The actuator needs the peer set when judging whether a control-plane
/// recreate is safe. Implemented against the Kubernetes API in
/// production, mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineLister: Send + Sync {
    /// Current machines in a namespace, as a point-in-time snapshot
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>>;
}

/// Lifecycle surface the controller drives
///
/// `update` owns the decision logic; the other operations are the
/// narrow verbs the reconcile loop composes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineActuator: Send + Sync {
    /// Whether a live instance backs the machine
    ///
    /// A failed lookup is an error, never `false`.
    async fn exists(&self, machine: &Machine) -> Result<bool>;

    /// Launch the instance the machine asks for
    async fn create(&self, machine: &Machine) -> Result<()>;

    /// Converge the machine's instance toward its spec
    ///
    /// Decides among create, no-op, and recreate on every call.
    async fn update(&self, machine: &Machine) -> Result<()>;

    /// Tear down whatever instance backs the machine
    async fn delete(&self, machine: &Machine) -> Result<()>;

    /// Live instance snapshot for status reporting
    async fn observed(&self, machine: &Machine) -> Result<Option<Instance>>;
}

/// Policy consulted before a control-plane member is recreated
///
/// Only control-plane machines reach the guard; workers recreate
/// freely. Swappable so operators with external quorum tracking can
/// plug in their own judgement.
pub trait RecreateGuard: Send + Sync {
    /// Whether `machine` may be torn down given the current peer set
    fn allow_recreate(&self, machine: &Machine, peers: &[Machine]) -> bool;
}

/// Default guard: never recreate the last control-plane member
///
/// Judged against the desired-state peer set, not live instances: a
/// peer machine that exists as a record but has no instance yet still
/// counts, because the controller is already working on it.
pub struct QuorumGuard;

impl RecreateGuard for QuorumGuard {
    fn allow_recreate(&self, machine: &Machine, peers: &[Machine]) -> bool {
        control_plane_machines(peers)
            .into_iter()
            .any(|peer| !machines_equal(peer, machine))
    }
}

/// Production actuator wiring the decision core to a provider
pub struct Actuator {
    instances: Arc<dyn InstanceService>,
    machines: Arc<dyn MachineLister>,
    guard: Box<dyn RecreateGuard>,
    in_flight: DashSet<String>,
}

impl Actuator {
    /// Create an actuator with the default control-plane guard
    pub fn new(instances: Arc<dyn InstanceService>, machines: Arc<dyn MachineLister>) -> Self {
        Self {
            instances,
            machines,
            guard: Box::new(QuorumGuard),
            in_flight: DashSet::new(),
        }
    }

    /// Replace the control-plane recreate policy
    pub fn with_guard(mut self, guard: Box<dyn RecreateGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// The machine's instance, with terminal states counting as absent
    ///
    /// An instance already shutting down is not worth comparing against
    /// and a replacement is due, whatever the provider reported.
    async fn live_instance(&self, machine: &Machine) -> Result<Option<Instance>> {
        let instance = self.instances.describe_instance(machine).await?;
        Ok(instance.filter(|i| !i.state.is_terminal()))
    }

    /// Launch while holding the machine's in-flight key
    async fn launch(&self, machine: &Machine) -> Result<()> {
        let key = machine_key(machine);
        if !self.in_flight.insert(key.clone()) {
            return Err(Error::provider_for(
                machine.name_any(),
                "another operation is in flight for this machine",
            ));
        }

        let result = self.instances.create_instance(machine).await;
        self.in_flight.remove(&key);
        result.map(|_| ())
    }

    /// Terminate and relaunch, gated for control-plane members
    async fn recreate(&self, machine: &Machine, instance: &Instance) -> Result<()> {
        let name = machine.name_any();

        if machine.spec.is_control_plane() {
            let namespace = machine.namespace().unwrap_or_default();
            let peers = self.machines.list_machines(&namespace).await?;
            if !self.guard.allow_recreate(machine, &peers) {
                return Err(Error::recreate_blocked(name));
            }
        }

        let key = machine_key(machine);
        if !self.in_flight.insert(key.clone()) {
            return Err(Error::provider_for(
                name,
                "another operation is in flight for this machine",
            ));
        }

        // Terminate before launching; two live instances with the same
        // identity tags would make every future lookup ambiguous.
        let result: Result<()> = async {
            self.instances.terminate_instance(machine, &instance.id).await?;
            self.instances.create_instance(machine).await.map(|_| ())
        }
        .await;

        self.in_flight.remove(&key);
        result
    }

    /// Best-effort tag convergence; failures never fail the pass
    async fn converge_tags(&self, machine: &Machine, instance: &Instance) {
        let missing: BTreeMap<String, String> = desired_tags(machine)
            .into_iter()
            .filter(|(k, v)| instance.tags.get(k) != Some(v))
            .collect();

        if missing.is_empty() {
            return;
        }

        if let Err(e) = self.instances.update_tags(machine, &instance.id, &missing).await {
            warn!(machine = %machine.name_any(), error = %e, "tag convergence failed");
        }
    }
}

#[async_trait]
impl MachineActuator for Actuator {
    async fn exists(&self, machine: &Machine) -> Result<bool> {
        Ok(self.live_instance(machine).await?.is_some())
    }

    async fn create(&self, machine: &Machine) -> Result<()> {
        info!(machine = %machine.name_any(), "creating instance");
        self.launch(machine).await
    }

    async fn update(&self, machine: &Machine) -> Result<()> {
        let name = machine.name_any();
        let config = &machine.spec.provider_config;

        let observed = self.live_instance(machine).await?;
        let op = plan(config, observed.as_ref());
        debug!(machine = %name, op = %op, "reconciliation decision");

        match op {
            MachineOp::Create => {
                // The instance vanished since the existence check
                info!(machine = %name, "instance gone, creating replacement");
                self.launch(machine).await
            }
            MachineOp::NoOp => {
                if let Some(instance) = &observed {
                    self.converge_tags(machine, instance).await;
                }
                Ok(())
            }
            MachineOp::Recreate => {
                let Some(instance) = observed else {
                    return Err(Error::internal_with_context(
                        "actuator",
                        "recreate decided without an observed instance",
                    ));
                };
                if let Some(field) = immutable_drift(config, &instance) {
                    info!(
                        machine = %name,
                        instance = %instance.id,
                        field = %field,
                        "immutable attribute drifted, recreating"
                    );
                }
                self.recreate(machine, &instance).await
            }
        }
    }

    async fn delete(&self, machine: &Machine) -> Result<()> {
        let name = machine.name_any();
        match self.live_instance(machine).await? {
            Some(instance) => {
                info!(machine = %name, instance = %instance.id, "terminating instance for deleted machine");
                self.instances.terminate_instance(machine, &instance.id).await
            }
            None => {
                debug!(machine = %name, "no instance to terminate");
                Ok(())
            }
        }
    }

    async fn observed(&self, machine: &Machine) -> Result<Option<Instance>> {
        self.live_instance(machine).await
    }
}

/// Serialization key for a machine's provider mutations
fn machine_key(machine: &Machine) -> String {
    format!(
        "{}/{}",
        machine.namespace().unwrap_or_default(),
        machine.name_any()
    )
}

/// Tags the machine's instance is supposed to carry
///
/// Identity tags override user-supplied tags of the same key.
fn desired_tags(machine: &Machine) -> BTreeMap<String, String> {
    let mut tags = machine.spec.provider_config.additional_tags.clone();
    tags.insert(MACHINE_NAME_TAG.to_string(), machine.name_any());
    tags.insert(
        MACHINE_NAMESPACE_TAG.to_string(),
        machine.namespace().unwrap_or_default(),
    );
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineProviderConfig, MachineSpec, MachineVersions, SubnetReference};
    use crate::provider::{InstanceState, MockInstanceService};
    use mockall::Sequence;

    fn machine(name: &str, namespace: &str, control_plane: Option<&str>) -> Machine {
        let spec = MachineSpec {
            versions: MachineVersions {
                kubelet: "v1.13.0".to_string(),
                control_plane: control_plane.map(str::to_string),
            },
            provider_config: MachineProviderConfig {
                ami: Some("ami-12345678".to_string()),
                instance_type: Some("t2.micro".to_string()),
                iam_instance_profile: Some("test-profile".to_string()),
                key_name: Some("SSHKey".to_string()),
                public_ip: Some(true),
                subnet: Some(SubnetReference {
                    id: Some("subnet-abcdef".to_string()),
                }),
                ..Default::default()
            },
        };
        let mut machine = Machine::new(name, spec);
        machine.metadata.namespace = Some(namespace.to_string());
        machine
    }

    /// Instance agreeing with the [`machine`] fixture's spec
    fn matching_instance() -> Instance {
        Instance {
            id: "i-0123456789abcdef0".to_string(),
            state: InstanceState::Running,
            instance_type: "t2.micro".to_string(),
            iam_profile: "test-profile".to_string(),
            key_name: Some("SSHKey".to_string()),
            public_ip: "192.0.2.1".to_string(),
            subnet_id: "subnet-abcdef".to_string(),
            tags: BTreeMap::from([
                ("Name".to_string(), "worker-0".to_string()),
                ("gantry.dev/namespace".to_string(), "awesome-ns".to_string()),
            ]),
        }
    }

    fn drifted_instance() -> Instance {
        Instance {
            instance_type: "m5.large".to_string(),
            ..matching_instance()
        }
    }

    fn actuator(instances: MockInstanceService, machines: MockMachineLister) -> Actuator {
        Actuator::new(Arc::new(instances), Arc::new(machines))
    }

    fn no_peers() -> MockMachineLister {
        let mut lister = MockMachineLister::new();
        lister.expect_list_machines().returning(|_| Ok(Vec::new()));
        lister
    }

    // ==========================================================================
    // Existence
    // ==========================================================================

    #[tokio::test]
    async fn test_exists_reflects_live_instance() {
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(matching_instance())));

        let actuator = actuator(instances, no_peers());
        assert!(actuator.exists(&machine("worker-0", "awesome-ns", None)).await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_false_on_positive_absence() {
        let mut instances = MockInstanceService::new();
        instances.expect_describe_instance().returning(|_| Ok(None));

        let actuator = actuator(instances, no_peers());
        assert!(!actuator.exists(&machine("worker-0", "awesome-ns", None)).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_lookup_is_an_error_not_absence() {
        // If this returned Ok(false), the controller would create a
        // duplicate instance every time EC2 had a bad minute.
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Err(Error::provider_for("worker-0", "RequestLimitExceeded")));

        let actuator = actuator(instances, no_peers());
        let err = actuator
            .exists(&machine("worker-0", "awesome-ns", None))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_terminal_instance_counts_as_absent() {
        let mut instances = MockInstanceService::new();
        instances.expect_describe_instance().returning(|_| {
            Ok(Some(Instance {
                state: InstanceState::ShuttingDown,
                ..matching_instance()
            }))
        });

        let actuator = actuator(instances, no_peers());
        let m = machine("worker-0", "awesome-ns", None);
        assert!(!actuator.exists(&m).await.unwrap());
        assert_eq!(actuator.observed(&m).await.unwrap(), None);
    }

    // ==========================================================================
    // Update Decisions
    // ==========================================================================

    #[tokio::test]
    async fn test_update_launches_when_instance_vanished() {
        let mut instances = MockInstanceService::new();
        instances.expect_describe_instance().returning(|_| Ok(None));
        instances
            .expect_create_instance()
            .times(1)
            .returning(|_| Ok(matching_instance()));

        let actuator = actuator(instances, no_peers());
        actuator.update(&machine("worker-0", "awesome-ns", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_is_a_noop_for_a_clean_instance() {
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(matching_instance())));
        // Tags already converged, so not even update_tags fires
        instances.expect_create_instance().never();
        instances.expect_terminate_instance().never();
        instances.expect_update_tags().never();

        let actuator = actuator(instances, no_peers());
        actuator.update(&machine("worker-0", "awesome-ns", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_converges_only_missing_tags() {
        let mut m = machine("worker-0", "awesome-ns", None);
        m.spec.provider_config.additional_tags =
            BTreeMap::from([("team".to_string(), "infra".to_string())]);

        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(matching_instance())));
        instances
            .expect_update_tags()
            .withf(|_, id, tags| {
                id == "i-0123456789abcdef0"
                    && tags.len() == 1
                    && tags.get("team").map(String::as_str) == Some("infra")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let actuator = actuator(instances, no_peers());
        actuator.update(&m).await.unwrap();
    }

    #[tokio::test]
    async fn test_tag_failure_does_not_fail_the_pass() {
        let mut m = machine("worker-0", "awesome-ns", None);
        m.spec.provider_config.additional_tags =
            BTreeMap::from([("team".to_string(), "infra".to_string())]);

        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(matching_instance())));
        instances
            .expect_update_tags()
            .returning(|_, _, _| Err(Error::provider_for("worker-0", "throttled")));

        let actuator = actuator(instances, no_peers());
        actuator.update(&m).await.unwrap();
    }

    #[tokio::test]
    async fn test_drifted_worker_is_terminated_then_relaunched() {
        let mut instances = MockInstanceService::new();
        let mut seq = Sequence::new();

        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(drifted_instance())));
        instances
            .expect_terminate_instance()
            .withf(|_, id| id == "i-0123456789abcdef0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        instances
            .expect_create_instance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(matching_instance()));

        let actuator = actuator(instances, no_peers());
        actuator.update(&machine("worker-0", "awesome-ns", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_recreate_never_consults_the_peer_list() {
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(drifted_instance())));
        instances.expect_terminate_instance().returning(|_, _| Ok(()));
        instances.expect_create_instance().returning(|_| Ok(matching_instance()));

        let mut lister = MockMachineLister::new();
        lister.expect_list_machines().never();

        let actuator = actuator(instances, lister);
        actuator.update(&machine("worker-0", "awesome-ns", None)).await.unwrap();
    }

    // ==========================================================================
    // Control-Plane Safety
    // ==========================================================================

    #[tokio::test]
    async fn test_last_control_plane_member_is_never_recreated() {
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(drifted_instance())));
        instances.expect_terminate_instance().never();
        instances.expect_create_instance().never();

        let mut lister = MockMachineLister::new();
        lister.expect_list_machines().returning(|_| {
            Ok(vec![
                machine("master-0", "awesome-ns", Some("v1.13.0")),
                machine("worker-0", "awesome-ns", None),
            ])
        });

        let actuator = actuator(instances, lister);
        let err = actuator
            .update(&machine("master-0", "awesome-ns", Some("v1.13.0")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RecreateBlocked { .. }));
        // Retryable: a peer may join and unblock the recreate
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_control_plane_recreate_proceeds_with_a_peer() {
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(drifted_instance())));
        instances.expect_terminate_instance().times(1).returning(|_, _| Ok(()));
        instances.expect_create_instance().times(1).returning(|_| Ok(matching_instance()));

        let mut lister = MockMachineLister::new();
        lister.expect_list_machines().returning(|_| {
            Ok(vec![
                machine("master-0", "awesome-ns", Some("v1.13.0")),
                machine("master-1", "awesome-ns", Some("v1.13.0")),
            ])
        });

        let actuator = actuator(instances, lister);
        actuator
            .update(&machine("master-0", "awesome-ns", Some("v1.13.0")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_peers_do_not_unblock_a_control_plane_recreate() {
        let guard = QuorumGuard;
        let target = machine("master-0", "awesome-ns", Some("v1.13.0"));

        // A namespace full of workers is no help for quorum
        let peers = vec![
            machine("master-0", "awesome-ns", Some("v1.13.0")),
            machine("worker-0", "awesome-ns", None),
            machine("worker-1", "awesome-ns", None),
        ];
        assert!(!guard.allow_recreate(&target, &peers));

        // The machine itself in the peer list does not count
        let just_self = vec![machine("master-0", "awesome-ns", Some("v1.13.0"))];
        assert!(!guard.allow_recreate(&target, &just_self));

        // A genuine second member does
        let with_peer = vec![
            machine("master-0", "awesome-ns", Some("v1.13.0")),
            machine("master-1", "awesome-ns", Some("v1.13.0")),
        ];
        assert!(guard.allow_recreate(&target, &with_peer));
    }

    // ==========================================================================
    // Deletion
    // ==========================================================================

    #[tokio::test]
    async fn test_delete_terminates_the_live_instance() {
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(matching_instance())));
        instances
            .expect_terminate_instance()
            .withf(|_, id| id == "i-0123456789abcdef0")
            .times(1)
            .returning(|_, _| Ok(()));

        let actuator = actuator(instances, no_peers());
        actuator.delete(&machine("worker-0", "awesome-ns", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_without_an_instance_is_a_noop() {
        let mut instances = MockInstanceService::new();
        instances.expect_describe_instance().returning(|_| Ok(None));
        instances.expect_terminate_instance().never();

        let actuator = actuator(instances, no_peers());
        actuator.delete(&machine("worker-0", "awesome-ns", None)).await.unwrap();
    }

    // ==========================================================================
    // Serialization
    // ==========================================================================

    #[tokio::test]
    async fn test_in_flight_key_is_released_after_recreate() {
        let mut instances = MockInstanceService::new();
        instances
            .expect_describe_instance()
            .returning(|_| Ok(Some(drifted_instance())));
        instances.expect_terminate_instance().times(2).returning(|_, _| Ok(()));
        instances.expect_create_instance().times(2).returning(|_| Ok(matching_instance()));

        let actuator = actuator(instances, no_peers());
        let m = machine("worker-0", "awesome-ns", None);

        // Two sequential passes both get to mutate; the key does not leak
        actuator.update(&m).await.unwrap();
        actuator.update(&m).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_key_is_released_after_a_failed_launch() {
        let mut instances = MockInstanceService::new();
        instances.expect_describe_instance().returning(|_| Ok(None));
        let mut seq = Sequence::new();
        instances
            .expect_create_instance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::provider_for("worker-0", "InsufficientInstanceCapacity")));
        instances
            .expect_create_instance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(matching_instance()));

        let actuator = actuator(instances, no_peers());
        let m = machine("worker-0", "awesome-ns", None);

        assert!(actuator.create(&m).await.is_err());
        // The failure released the key, so the retry pass can launch
        actuator.create(&m).await.unwrap();
    }

    #[test]
    fn test_machine_key_is_namespace_scoped() {
        assert_eq!(
            machine_key(&machine("worker-0", "awesome-ns", None)),
            "awesome-ns/worker-0"
        );
        assert_ne!(
            machine_key(&machine("worker-0", "awesome-ns", None)),
            machine_key(&machine("worker-0", "other-ns", None))
        );
    }

    #[test]
    fn test_desired_tags_identity_wins() {
        let mut m = machine("worker-0", "awesome-ns", None);
        m.spec.provider_config.additional_tags = BTreeMap::from([
            ("Name".to_string(), "impostor".to_string()),
            ("team".to_string(), "infra".to_string()),
        ]);

        let tags = desired_tags(&m);
        assert_eq!(tags.get("Name").map(String::as_str), Some("worker-0"));
        assert_eq!(
            tags.get("gantry.dev/namespace").map(String::as_str),
            Some("awesome-ns")
        );
        assert_eq!(tags.get("team").map(String::as_str), Some("infra"));
    }
}
