//! Instance operations backed by the `aws` CLI.
//!
//! Every call shells out to `aws ec2 ... --output json` and parses the
//! JSON response. Instances are correlated to machines purely through
//! tags: the machine name goes into the `Name` tag and the namespace
//! into a dedicated namespace tag, so a lookup is a filtered
//! `describe-instances` rather than a stored instance ID.
//!
//! Command assembly and response parsing are free functions so they can
//! be tested without an AWS account.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::crd::{Machine, MachineProviderConfig};
use crate::provider::{Instance, InstanceService, InstanceState};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, MACHINE_NAME_TAG, MACHINE_NAMESPACE_TAG};

/// Maximum time to wait for a single CLI invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// States a lookup considers live. Shutting-down and terminated
/// instances are already on their way out and count as absent.
const LIVE_STATES: &str = "pending,running,stopping,stopped";

/// EC2's error code for an instance that no longer exists
const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

/// [`InstanceService`] implementation that drives the `aws` CLI
///
/// Credentials come from the ambient chain (environment, credential
/// file, instance metadata). Region and profile can be pinned per
/// service instance.
pub struct AwsCliInstanceService {
    region: Option<String>,
    profile: Option<String>,
    retry: RetryConfig,
}

impl AwsCliInstanceService {
    /// Create a service that uses the ambient AWS credential chain
    pub fn new() -> Self {
        Self {
            region: None,
            profile: None,
            retry: RetryConfig::default(),
        }
    }

    /// Pin all CLI calls to a region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Use a named profile from the AWS credential file
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Run `aws ec2 <args>` and return stdout on success
    async fn run_ec2(&self, machine: &str, args: &[String]) -> Result<String> {
        let op = args.first().map(String::as_str).unwrap_or_default();

        let mut cmd = Command::new("aws");
        cmd.arg("ec2").args(args).arg("--output").arg("json");
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }

        debug!(machine = %machine, operation = %op, "running aws ec2 command");

        let output = timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::provider_for(machine, format!("aws ec2 {op} timed out")))?
            .map_err(|e| Error::provider_for(machine, format!("failed to execute aws cli: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provider_for(
                machine,
                format!("aws ec2 {op} failed: {}", stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// One terminate attempt, treating an already-gone instance as done
    async fn terminate_once(&self, machine: &str, instance_id: &str, args: &[String]) -> Result<()> {
        match self.run_ec2(machine, args).await {
            Ok(_) => Ok(()),
            Err(e) if already_gone(&e) => {
                debug!(machine = %machine, instance = %instance_id, "instance already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for AwsCliInstanceService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceService for AwsCliInstanceService {
    async fn describe_instance(&self, machine: &Machine) -> Result<Option<Instance>> {
        let name = machine.name_any();
        let namespace = machine.namespace().unwrap_or_default();
        let args = describe_args(&name, &namespace);

        let stdout =
            retry_with_backoff(&self.retry, "describe-instances", || self.run_ec2(&name, &args))
                .await?;

        let doc: Value = serde_json::from_str(&stdout).map_err(|e| {
            Error::provider_permanent(&name, format!("describe-instances returned invalid JSON: {e}"))
        })?;

        let mut found = instances_from_describe(&doc, &name)?;
        if found.len() > 1 {
            warn!(
                machine = %name,
                count = found.len(),
                "multiple live instances carry this machine's tags, using the first"
            );
        }

        if found.is_empty() {
            debug!(machine = %name, "no live instance found");
            Ok(None)
        } else {
            Ok(Some(found.remove(0)))
        }
    }

    async fn create_instance(&self, machine: &Machine) -> Result<Instance> {
        let name = machine.name_any();
        let namespace = machine.namespace().unwrap_or_default();
        let config = &machine.spec.provider_config;

        config.validate_for_create(&name)?;

        let args = run_instances_args(&name, &namespace, config);

        // Never retried inside the pass: a timed-out launch may still
        // have succeeded, and a second launch would orphan the first.
        let stdout = self.run_ec2(&name, &args).await?;

        let doc: Value = serde_json::from_str(&stdout).map_err(|e| {
            Error::provider_permanent(&name, format!("run-instances returned invalid JSON: {e}"))
        })?;

        let created = doc
            .get("Instances")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .ok_or_else(|| Error::provider_permanent(&name, "run-instances returned no instances"))?;

        let instance = instance_from_json(created, &name)?;
        info!(machine = %name, instance = %instance.id, "launched instance");
        Ok(instance)
    }

    async fn terminate_instance(&self, machine: &Machine, instance_id: &str) -> Result<()> {
        let name = machine.name_any();
        let args = vec![
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
            instance_id.to_string(),
        ];

        retry_with_backoff(&self.retry, "terminate-instances", || {
            self.terminate_once(&name, instance_id, &args)
        })
        .await?;

        info!(machine = %name, instance = %instance_id, "terminated instance");
        Ok(())
    }

    async fn update_tags(
        &self,
        machine: &Machine,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }

        let name = machine.name_any();
        let tag_list: Vec<Value> = tags
            .iter()
            .map(|(k, v)| serde_json::json!({"Key": k, "Value": v}))
            .collect();
        let args = vec![
            "create-tags".to_string(),
            "--resources".to_string(),
            instance_id.to_string(),
            "--tags".to_string(),
            Value::Array(tag_list).to_string(),
        ];

        retry_with_backoff(&self.retry, "create-tags", || self.run_ec2(&name, &args)).await?;

        debug!(machine = %name, instance = %instance_id, count = tags.len(), "applied tags");
        Ok(())
    }
}

/// True when the error is EC2 telling us the instance no longer exists
fn already_gone(err: &Error) -> bool {
    matches!(err, Error::Provider { message, .. } if message.contains(INSTANCE_NOT_FOUND))
}

/// Arguments for the tag-filtered lookup of a machine's instance
fn describe_args(name: &str, namespace: &str) -> Vec<String> {
    vec![
        "describe-instances".to_string(),
        "--filters".to_string(),
        format!("Name=tag:{MACHINE_NAME_TAG},Values={name}"),
        format!("Name=tag:{MACHINE_NAMESPACE_TAG},Values={namespace}"),
        format!("Name=instance-state-name,Values={LIVE_STATES}"),
    ]
}

/// Arguments for launching the instance a machine asks for
///
/// Assumes the config already passed
/// [`validate_for_create`](MachineProviderConfig::validate_for_create).
fn run_instances_args(name: &str, namespace: &str, config: &MachineProviderConfig) -> Vec<String> {
    let mut args = vec![
        "run-instances".to_string(),
        "--count".to_string(),
        "1".to_string(),
    ];

    if let Some(ami) = config.ami.as_deref() {
        args.push("--image-id".to_string());
        args.push(ami.to_string());
    }
    if let Some(instance_type) = config.instance_type.as_deref() {
        args.push("--instance-type".to_string());
        args.push(instance_type.to_string());
    }
    if let Some(key) = config.key_name.as_deref().filter(|k| !k.is_empty()) {
        args.push("--key-name".to_string());
        args.push(key.to_string());
    }
    if let Some(profile) = config.iam_instance_profile.as_deref().filter(|p| !p.is_empty()) {
        args.push("--iam-instance-profile".to_string());
        args.push(format!("Name={profile}"));
    }
    if let Some(subnet) = config.subnet_id().filter(|s| !s.is_empty()) {
        args.push("--subnet-id".to_string());
        args.push(subnet.to_string());
    }
    match config.public_ip {
        Some(true) => args.push("--associate-public-ip-address".to_string()),
        Some(false) => args.push("--no-associate-public-ip-address".to_string()),
        None => {}
    }
    if !config.security_groups.is_empty() {
        args.push("--security-group-ids".to_string());
        args.extend(config.security_groups.iter().cloned());
    }
    if let Some(size) = config.root_device_size {
        args.push("--block-device-mappings".to_string());
        args.push(root_device_mapping(size));
    }

    args.push("--tag-specifications".to_string());
    args.push(tag_specification(name, namespace, &config.additional_tags));

    args
}

/// Block device mapping JSON for a resized root volume
///
/// Assumes the AMI's root device is /dev/sda1.
fn root_device_mapping(size: i64) -> String {
    serde_json::json!([{
        "DeviceName": "/dev/sda1",
        "Ebs": {"VolumeSize": size, "DeleteOnTermination": true}
    }])
    .to_string()
}

/// Tag specification JSON for a launch
///
/// Identity tags always win over user-supplied tags of the same key;
/// lookups depend on them.
fn tag_specification(name: &str, namespace: &str, additional: &BTreeMap<String, String>) -> String {
    let mut tag_list = vec![
        serde_json::json!({"Key": MACHINE_NAME_TAG, "Value": name}),
        serde_json::json!({"Key": MACHINE_NAMESPACE_TAG, "Value": namespace}),
    ];
    for (k, v) in additional {
        if k == MACHINE_NAME_TAG || k == MACHINE_NAMESPACE_TAG {
            continue;
        }
        tag_list.push(serde_json::json!({"Key": k, "Value": v}));
    }
    serde_json::json!([{"ResourceType": "instance", "Tags": tag_list}]).to_string()
}

/// Flatten a describe-instances response into instances
fn instances_from_describe(doc: &Value, machine: &str) -> Result<Vec<Instance>> {
    let reservations = doc
        .get("Reservations")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::provider_permanent(machine, "describe-instances output missing Reservations")
        })?;

    let mut instances = Vec::new();
    for reservation in reservations {
        let in_reservation = reservation
            .get("Instances")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::provider_permanent(machine, "reservation missing Instances"))?;
        for value in in_reservation {
            instances.push(instance_from_json(value, machine)?);
        }
    }
    Ok(instances)
}

/// Parse one instance record from EC2's JSON shape
///
/// Fields EC2 omits (no public IP, no IAM profile) come back as empty
/// strings, which is what the drift rules expect for "no value".
fn instance_from_json(value: &Value, machine: &str) -> Result<Instance> {
    let id = value
        .get("InstanceId")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::provider_permanent(machine, "instance record missing InstanceId"))?
        .to_string();

    let state_name = value
        .pointer("/State/Name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::provider_permanent(machine, format!("instance {id} missing State.Name"))
        })?;
    let state = state_name.parse::<InstanceState>().map_err(|_| {
        Error::provider_permanent(machine, format!("instance {id} in unknown state {state_name}"))
    })?;

    let str_field =
        |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    let iam_profile = value
        .pointer("/IamInstanceProfile/Arn")
        .and_then(Value::as_str)
        .map(profile_name_from_arn)
        .unwrap_or_default()
        .to_string();

    let mut tags = BTreeMap::new();
    if let Some(tag_list) = value.get("Tags").and_then(Value::as_array) {
        for tag in tag_list {
            if let (Some(k), Some(v)) = (
                tag.get("Key").and_then(Value::as_str),
                tag.get("Value").and_then(Value::as_str),
            ) {
                tags.insert(k.to_string(), v.to_string());
            }
        }
    }

    Ok(Instance {
        id,
        state,
        instance_type: str_field("InstanceType"),
        iam_profile,
        key_name: value.get("KeyName").and_then(Value::as_str).map(str::to_string),
        public_ip: str_field("PublicIpAddress"),
        subnet_id: str_field("SubnetId"),
        tags,
    })
}

/// Extract the profile name from an instance-profile ARN
///
/// DescribeInstances only reports the ARN; specs carry the bare name.
fn profile_name_from_arn(arn: &str) -> &str {
    match arn.rsplit_once('/') {
        Some((_, name)) => name,
        None => arn,
    }
}
