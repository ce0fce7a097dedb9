//! Machine controller implementation
//!
//! This module implements the reconciliation logic for Machine resources.
//! It follows the Kubernetes controller pattern: observe the backing
//! instance, compare it against the spec, and act on the difference.
//! The provider-facing half of each pass lives in [`crate::actuator`];
//! this module owns the Kubernetes-facing half (finalizers, status,
//! requeue policy).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::actuator::{Actuator, MachineActuator, MachineLister};
use crate::crd::{Condition, ConditionStatus, Machine, MachinePhase, MachineStatus};
use crate::provider::{AwsCliInstanceService, Instance, InstanceState};
use crate::Error;

/// Finalizer guaranteeing instance teardown before a Machine disappears
pub const MACHINE_FINALIZER: &str = "gantry.dev/instance-teardown";

/// Field manager recorded on every patch this controller issues
const FIELD_MANAGER: &str = "gantry-controller";

/// Requeue interval while an instance is launching
const PROVISION_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Requeue interval for healthy machines; each pass re-checks drift
const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Trait abstracting Kubernetes client operations for Machines
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Patch the status subresource of a Machine
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineStatus,
    ) -> Result<(), Error>;

    /// Add the teardown finalizer to a machine, if missing
    async fn add_finalizer(&self, machine: &Machine) -> Result<(), Error>;

    /// Remove the teardown finalizer from a machine, if present
    async fn remove_finalizer(&self, machine: &Machine) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct MachineClientImpl {
    client: Client,
}

impl MachineClientImpl {
    /// Create a new MachineClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn machines_in(&self, namespace: &str) -> Result<Vec<Machine>, Error> {
        let machines = self.machines(namespace).list(&Default::default()).await?;
        Ok(machines.items)
    }

    async fn patch_finalizers(
        &self,
        machine: &Machine,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let name = machine.name_any();
        let namespace = machine.namespace().unwrap_or_default();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        self.machines(&namespace)
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

#[async_trait]
impl MachineClient for MachineClientImpl {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.machines(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(())
    }

    async fn add_finalizer(&self, machine: &Machine) -> Result<(), Error> {
        let mut finalizers = machine.finalizers().to_vec();
        if finalizers.iter().any(|f| f == MACHINE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(MACHINE_FINALIZER.to_string());
        self.patch_finalizers(machine, finalizers).await
    }

    async fn remove_finalizer(&self, machine: &Machine) -> Result<(), Error> {
        let finalizers: Vec<String> = machine
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != MACHINE_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(machine, finalizers).await
    }
}

// The actuator's peer lookups go through the same API surface
#[async_trait]
impl MachineLister for MachineClientImpl {
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error> {
        self.machines_in(namespace).await
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds
/// resources that are expensive to create (like Kubernetes clients).
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .region("us-east-1")
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn MachineClient>,
    /// Actuator driving provider operations
    pub actuator: Arc<dyn MachineActuator>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    ///
    /// Equivalent to `Context::builder(client).build()`.
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom mock clients
    ///
    /// This method is primarily for unit tests where a real Kubernetes
    /// client is not available. For production code, use [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn MachineClient>, actuator: Arc<dyn MachineActuator>) -> Self {
        Self { kube, actuator }
    }
}

/// Builder for constructing [`Context`] instances
///
/// # Examples
///
/// Default context against the ambient AWS credentials:
/// ```ignore
/// let ctx = Context::builder(client).build();
/// ```
///
/// Pinned region and credential profile:
/// ```ignore
/// let ctx = Context::builder(client)
///     .region("us-east-1")
///     .profile("prod")
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn MachineClient>>,
    actuator: Option<Arc<dyn MachineActuator>>,
    region: Option<String>,
    profile: Option<String>,
}

impl ContextBuilder {
    /// Create a new builder with the given Kubernetes client
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            actuator: None,
            region: None,
            profile: None,
        }
    }

    /// Pin provider calls to an AWS region
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Use a named AWS credential profile
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn MachineClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the actuator (primarily for testing)
    pub fn machine_actuator(mut self, actuator: Arc<dyn MachineActuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let Self {
            client,
            kube,
            actuator,
            region,
            profile,
        } = self;

        let kube_impl = Arc::new(MachineClientImpl::new(client));

        let actuator = actuator.unwrap_or_else(|| {
            let mut service = AwsCliInstanceService::new();
            if let Some(region) = region {
                service = service.with_region(region);
            }
            if let Some(profile) = profile {
                service = service.with_profile(profile);
            }
            Arc::new(Actuator::new(Arc::new(service), kube_impl.clone()))
        });

        Context {
            kube: match kube {
                Some(kube) => kube,
                None => kube_impl,
            },
            actuator,
        }
    }
}

/// Reconcile a Machine resource
///
/// One pass: take the finalizer, validate the spec, make sure an
/// instance backs the machine, converge it, and report what we saw in
/// status. Deletion runs the teardown path instead.
///
/// # Arguments
///
/// * `machine` - The Machine resource to reconcile
/// * `ctx` - Shared controller context
///
/// # Returns
///
/// Returns an `Action` indicating when to requeue the resource, or an
/// error if reconciliation failed.
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling machine");

    if machine.metadata.deletion_timestamp.is_some() {
        return reconcile_deletion(&machine, &ctx).await;
    }

    // The finalizer goes on before any instance can exist, so deletion
    // can never race a launch we would then orphan
    if !has_finalizer(&machine) {
        debug!("adding finalizer");
        ctx.kube.add_finalizer(&machine).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Err(e) = machine.spec.validate() {
        warn!(error = %e, "machine validation failed");
        update_status_failed(&machine, &ctx, &e.to_string()).await?;
        // Don't requeue for validation errors - they require spec changes
        return Ok(Action::await_change());
    }

    if !ctx.actuator.exists(&machine).await? {
        info!("no instance backing machine, creating");
        if let Err(e) = ctx.actuator.create(&machine).await {
            if !e.is_retryable() {
                update_status_failed(&machine, &ctx, &e.to_string()).await?;
                return Ok(Action::await_change());
            }
            return Err(e);
        }
        update_status_provisioning(&machine, &ctx, None).await?;
        return Ok(Action::requeue(PROVISION_CHECK_INTERVAL));
    }

    ctx.actuator.update(&machine).await?;

    // Report what actually backs the machine now; an update that
    // recreated the instance leaves a fresh pending one behind
    match ctx.actuator.observed(&machine).await? {
        Some(instance) if instance.state == InstanceState::Running => {
            update_status_running(&machine, &ctx, &instance).await?;
            Ok(Action::requeue(DRIFT_CHECK_INTERVAL))
        }
        Some(instance) => {
            update_status_provisioning(&machine, &ctx, Some(&instance)).await?;
            Ok(Action::requeue(PROVISION_CHECK_INTERVAL))
        }
        None => {
            update_status_provisioning(&machine, &ctx, None).await?;
            Ok(Action::requeue(PROVISION_CHECK_INTERVAL))
        }
    }
}

/// Teardown path for a machine with a deletion timestamp
async fn reconcile_deletion(machine: &Machine, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(machine) {
        // Nothing left for us; deletion proceeds without teardown
        debug!("deleted machine carries no finalizer, ignoring");
        return Ok(Action::await_change());
    }

    info!("machine deleted, tearing down instance");
    update_status_deleting(machine, ctx).await?;
    ctx.actuator.delete(machine).await?;
    ctx.kube.remove_finalizer(machine).await?;

    info!("teardown complete, finalizer released");
    Ok(Action::await_change())
}

fn has_finalizer(machine: &Machine) -> bool {
    machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER)
}

/// Error policy for the controller
///
/// Called when reconciliation fails. Retryable errors requeue on a
/// short timer; permanent ones wait for the spec to change, since
/// retrying them can only fail the same way.
pub fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        machine = %machine.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::await_change()
    }
}

/// Update machine status to Provisioning phase
async fn update_status_provisioning(
    machine: &Machine,
    ctx: &Context,
    instance: Option<&Instance>,
) -> Result<(), Error> {
    let condition = Condition::new(
        "Provisioning",
        ConditionStatus::True,
        "InstanceLaunching",
        "Waiting for the instance to reach running",
    );

    let mut status = MachineStatus::with_phase(MachinePhase::Provisioning)
        .message("Provisioning instance")
        .condition(condition);
    if let Some(instance) = instance {
        status = status.instance(&instance.id, instance.state.to_string());
    }

    patch_status(machine, ctx, &status).await?;

    info!("updated status to Provisioning");
    Ok(())
}

/// Update machine status to Running phase
async fn update_status_running(
    machine: &Machine,
    ctx: &Context,
    instance: &Instance,
) -> Result<(), Error> {
    let condition = Condition::new(
        "Ready",
        ConditionStatus::True,
        "InstanceRunning",
        "Instance is running and matches the spec",
    );

    let status = MachineStatus::with_phase(MachinePhase::Running)
        .message("Instance running")
        .instance(&instance.id, instance.state.to_string())
        .condition(condition);

    patch_status(machine, ctx, &status).await?;

    debug!(instance = %instance.id, "updated status to Running");
    Ok(())
}

/// Update machine status to Deleting phase
async fn update_status_deleting(machine: &Machine, ctx: &Context) -> Result<(), Error> {
    let condition = Condition::new(
        "Deleting",
        ConditionStatus::True,
        "InstanceTerminating",
        "Tearing down the backing instance",
    );

    let status = MachineStatus::with_phase(MachinePhase::Deleting)
        .message("Terminating instance")
        .condition(condition);

    patch_status(machine, ctx, &status).await?;

    info!("updated status to Deleting");
    Ok(())
}

/// Update machine status to Failed phase
async fn update_status_failed(machine: &Machine, ctx: &Context, message: &str) -> Result<(), Error> {
    let condition = Condition::new("Ready", ConditionStatus::False, "ValidationFailed", message);

    let status = MachineStatus::with_phase(MachinePhase::Failed)
        .message(message.to_string())
        .condition(condition);

    patch_status(machine, ctx, &status).await?;

    warn!(message, "updated status to Failed");
    Ok(())
}

async fn patch_status(machine: &Machine, ctx: &Context, status: &MachineStatus) -> Result<(), Error> {
    let name = machine.name_any();
    let namespace = machine.namespace().unwrap_or_default();
    ctx.kube.patch_status(&namespace, &name, status).await
}
