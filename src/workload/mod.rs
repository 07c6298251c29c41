//! Pod types for Buildkit workloads
//!
//! This module defines the subset of the Kubernetes Pod schema the operator builds
//! and lets templates override. Every type implements [`Merge`] so layered
//! fragments combine additively:
//! - containers, init containers, volumes and image pull secrets merge by `name`
//! - env vars merge by `name`, ports by `containerPort`, mounts by `mountPath`
//! - topology spread constraints merge by `topologyKey`
//! - command, args and tolerations are replaced as a whole
//!
//! Fields without a typed counterpart land in each type's `extra` map and are
//! merged with the free-form JSON rules, so a fragment may use any pod field.
//!
//! A finished [`Pod`] is converted to the `k8s-openapi` type with [`Pod::to_k8s`]
//! right before it is created.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use schemars::gen::SchemaGenerator;
use schemars::schema::{ArrayValidation, InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::merge::{merge_atomic, merge_field, merge_keyed, Merge, MergeError, MergeKey};
use crate::quantity::Quantity;
use crate::resources::ResourceRequirements;

/// Free-form JSON object for schema areas the operator passes through untouched
pub type FreeForm = BTreeMap<String, serde_json::Value>;

/// Schema for an object the API server keeps as written
///
/// Types here flatten unknown fields into `extra`, which a structural CRD
/// schema cannot express next to typed properties.
pub fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut extensions = schemars::Map::new();
    extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions,
        ..Default::default()
    })
}

/// Schema for a list of objects the API server keeps as written
pub fn preserve_unknown_list(gen: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(preserve_unknown_fields(gen).into()),
            ..Default::default()
        })),
        ..Default::default()
    })
}

// =============================================================================
// Pod
// =============================================================================

/// A pod, or a partial pod used as an override layer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Pod metadata
    #[serde(default)]
    pub metadata: PodMeta,
    /// Pod spec
    #[serde(default)]
    pub spec: PodSpec,
}

impl Pod {
    /// Convert into the API type, attaching an owner reference when given
    pub fn to_k8s(
        &self,
        owner: Option<OwnerReference>,
    ) -> Result<k8s_openapi::api::core::v1::Pod, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(fields) = value.as_object_mut() {
            fields.insert("apiVersion".to_string(), "v1".into());
            fields.insert("kind".to_string(), "Pod".into());
        }
        let mut pod: k8s_openapi::api::core::v1::Pod = serde_json::from_value(value)?;
        if let Some(owner) = owner {
            pod.metadata.owner_references = Some(vec![owner]);
        }
        Ok(pod)
    }

    /// The container with the given name
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.spec.containers.iter().find(|c| c.name == name)
    }

    /// Mutable access to the container with the given name
    pub fn container_mut(&mut self, name: &str) -> Option<&mut Container> {
        self.spec.containers.iter_mut().find(|c| c.name == name)
    }
}

impl Merge for Pod {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.metadata, &other.metadata, "metadata")?;
        merge_field(&mut self.spec, &other.spec, "spec")
    }
}

/// Pod metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    /// Explicit name; left empty so the API server generates one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Prefix for the server-generated name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    /// Namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for PodMeta {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.name, &other.name, "name")?;
        merge_field(&mut self.generate_name, &other.generate_name, "generateName")?;
        merge_field(&mut self.namespace, &other.namespace, "namespace")?;
        merge_field(&mut self.labels, &other.labels, "labels")?;
        merge_field(&mut self.annotations, &other.annotations, "annotations")?;
        self.extra.merge_from(&other.extra)
    }
}

/// Pod spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
    /// Init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Restart policy: Always, OnFailure or Never
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_policy: String,
    /// Seconds the pod may take to stop gracefully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    /// Seconds the pod may run before it is terminated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    /// Service account name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Affinity, passed through as written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<FreeForm>,
    /// Priority class name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority_class_name: String,
    /// Topology spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    /// Whether the pod shares the host user namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_users: Option<bool>,
    /// Image pull secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for PodSpec {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_keyed(&mut self.containers, &other.containers, "containers")?;
        merge_keyed(
            &mut self.init_containers,
            &other.init_containers,
            "initContainers",
        )?;
        merge_keyed(&mut self.volumes, &other.volumes, "volumes")?;
        merge_field(&mut self.restart_policy, &other.restart_policy, "restartPolicy")?;
        merge_field(
            &mut self.termination_grace_period_seconds,
            &other.termination_grace_period_seconds,
            "terminationGracePeriodSeconds",
        )?;
        merge_field(
            &mut self.active_deadline_seconds,
            &other.active_deadline_seconds,
            "activeDeadlineSeconds",
        )?;
        merge_field(
            &mut self.service_account_name,
            &other.service_account_name,
            "serviceAccountName",
        )?;
        merge_field(&mut self.node_selector, &other.node_selector, "nodeSelector")?;
        merge_atomic(&mut self.tolerations, &other.tolerations);
        merge_field(&mut self.affinity, &other.affinity, "affinity")?;
        merge_field(
            &mut self.priority_class_name,
            &other.priority_class_name,
            "priorityClassName",
        )?;
        merge_keyed(
            &mut self.topology_spread_constraints,
            &other.topology_spread_constraints,
            "topologySpreadConstraints",
        )?;
        merge_field(&mut self.host_users, &other.host_users, "hostUsers")?;
        merge_keyed(
            &mut self.image_pull_secrets,
            &other.image_pull_secrets,
            "imagePullSecrets",
        )?;
        self.extra.merge_from(&other.extra)
    }
}

// =============================================================================
// Containers
// =============================================================================

/// Container spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name
    pub name: String,
    /// Image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Image pull policy
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    /// Liveness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    /// Lifecycle hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    /// Security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Container {
    /// Create a container with a name and image
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }
}

impl MergeKey for Container {
    fn merge_key(&self) -> String {
        self.name.clone()
    }
}

impl Merge for Container {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.name, &other.name, "name")?;
        merge_field(&mut self.image, &other.image, "image")?;
        merge_field(
            &mut self.image_pull_policy,
            &other.image_pull_policy,
            "imagePullPolicy",
        )?;
        merge_atomic(&mut self.command, &other.command);
        merge_atomic(&mut self.args, &other.args);
        merge_keyed(&mut self.env, &other.env, "env")?;
        merge_keyed(&mut self.ports, &other.ports, "ports")?;
        merge_keyed(&mut self.volume_mounts, &other.volume_mounts, "volumeMounts")?;
        merge_field(&mut self.resources, &other.resources, "resources")?;
        merge_field(
            &mut self.readiness_probe,
            &other.readiness_probe,
            "readinessProbe",
        )?;
        merge_field(
            &mut self.liveness_probe,
            &other.liveness_probe,
            "livenessProbe",
        )?;
        merge_field(&mut self.lifecycle, &other.lifecycle, "lifecycle")?;
        merge_field(
            &mut self.security_context,
            &other.security_context,
            "securityContext",
        )?;
        self.extra.merge_from(&other.extra)
    }
}

/// Environment variable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl EnvVar {
    /// Create an environment variable
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

impl MergeKey for EnvVar {
    fn merge_key(&self) -> String {
        self.name.clone()
    }
}

impl Merge for EnvVar {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.value, &other.value, "value")?;
        self.extra.merge_from(&other.extra)
    }
}

/// Container port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    /// Port name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Port number
    pub container_port: i32,
    /// Protocol
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl MergeKey for ContainerPort {
    fn merge_key(&self) -> String {
        self.container_port.to_string()
    }
}

impl Merge for ContainerPort {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.name, &other.name, "name")?;
        merge_field(&mut self.protocol, &other.protocol, "protocol")?;
        self.extra.merge_from(&other.extra)
    }
}

/// Volume mount
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name
    pub name: String,
    /// Mount path in the container
    pub mount_path: String,
    /// Mount read-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Path within the volume
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_path: String,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl VolumeMount {
    /// Mount the named volume at `mount_path`
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            ..Default::default()
        }
    }
}

impl MergeKey for VolumeMount {
    fn merge_key(&self) -> String {
        self.mount_path.clone()
    }
}

impl Merge for VolumeMount {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.name, &other.name, "name")?;
        merge_field(&mut self.read_only, &other.read_only, "readOnly")?;
        merge_field(&mut self.sub_path, &other.sub_path, "subPath")?;
        self.extra.merge_from(&other.extra)
    }
}

// =============================================================================
// Probes and lifecycle
// =============================================================================

/// Probe specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// gRPC health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcAction>,
    /// Exec probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    /// Initial delay seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    /// Period seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    /// Timeout seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    /// Failures before the probe is considered failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for Probe {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.grpc, &other.grpc, "grpc")?;
        merge_field(&mut self.exec, &other.exec, "exec")?;
        merge_field(
            &mut self.initial_delay_seconds,
            &other.initial_delay_seconds,
            "initialDelaySeconds",
        )?;
        merge_field(&mut self.period_seconds, &other.period_seconds, "periodSeconds")?;
        merge_field(
            &mut self.timeout_seconds,
            &other.timeout_seconds,
            "timeoutSeconds",
        )?;
        merge_field(
            &mut self.failure_threshold,
            &other.failure_threshold,
            "failureThreshold",
        )?;
        self.extra.merge_from(&other.extra)
    }
}

/// gRPC health check against a container port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrpcAction {
    /// Port number
    pub port: i32,
    /// Service name reported to the health check
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for GrpcAction {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        if other.port != 0 {
            self.port = other.port;
        }
        merge_field(&mut self.service, &other.service, "service")?;
        self.extra.merge_from(&other.extra)
    }
}

/// Command executed inside the container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    /// Command line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for ExecAction {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_atomic(&mut self.command, &other.command);
        self.extra.merge_from(&other.extra)
    }
}

/// Container lifecycle hooks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    /// Hook run before the container is stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<LifecycleHandler>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for Lifecycle {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.pre_stop, &other.pre_stop, "preStop")?;
        self.extra.merge_from(&other.extra)
    }
}

/// Action taken by a lifecycle hook
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHandler {
    /// Command to execute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for LifecycleHandler {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.exec, &other.exec, "exec")?;
        self.extra.merge_from(&other.extra)
    }
}

// =============================================================================
// Security
// =============================================================================

/// Container security context
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    /// Run the container privileged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    /// UID to run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// GID to run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    /// Require a non-root user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    /// Seccomp profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<SecurityProfile>,
    /// AppArmor profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_armor_profile: Option<SecurityProfile>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for SecurityContext {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.privileged, &other.privileged, "privileged")?;
        merge_field(&mut self.run_as_user, &other.run_as_user, "runAsUser")?;
        merge_field(&mut self.run_as_group, &other.run_as_group, "runAsGroup")?;
        merge_field(
            &mut self.run_as_non_root,
            &other.run_as_non_root,
            "runAsNonRoot",
        )?;
        merge_field(
            &mut self.seccomp_profile,
            &other.seccomp_profile,
            "seccompProfile",
        )?;
        merge_field(
            &mut self.app_armor_profile,
            &other.app_armor_profile,
            "appArmorProfile",
        )?;
        self.extra.merge_from(&other.extra)
    }
}

/// Seccomp or AppArmor profile selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityProfile {
    /// Profile type: RuntimeDefault, Localhost or Unconfined
    #[serde(rename = "type")]
    pub type_: String,
    /// Profile name when the type is Localhost
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub localhost_profile: String,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl SecurityProfile {
    /// Profile that disables confinement
    pub fn unconfined() -> Self {
        Self {
            type_: "Unconfined".to_string(),
            ..Default::default()
        }
    }
}

impl Merge for SecurityProfile {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.type_, &other.type_, "type")?;
        merge_field(
            &mut self.localhost_profile,
            &other.localhost_profile,
            "localhostProfile",
        )?;
        self.extra.merge_from(&other.extra)
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// Volume definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Scratch space tied to the pod's lifetime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    /// ConfigMap projected as files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,
    /// Secret projected as files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Volume {
    /// An empty scratch volume
    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    }

    /// A volume backed by a ConfigMap
    pub fn config_map(
        name: impl Into<String>,
        config_map: impl Into<String>,
        default_mode: Option<i32>,
    ) -> Self {
        Self {
            name: name.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.into(),
                default_mode,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl MergeKey for Volume {
    fn merge_key(&self) -> String {
        self.name.clone()
    }
}

impl Merge for Volume {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.empty_dir, &other.empty_dir, "emptyDir")?;
        merge_field(&mut self.config_map, &other.config_map, "configMap")?;
        merge_field(&mut self.secret, &other.secret, "secret")?;
        self.extra.merge_from(&other.extra)
    }
}

/// EmptyDir volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirVolumeSource {
    /// Storage medium; empty for node disk, `Memory` for tmpfs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub medium: String,
    /// Maximum size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<Quantity>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for EmptyDirVolumeSource {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.medium, &other.medium, "medium")?;
        merge_field(&mut self.size_limit, &other.size_limit, "sizeLimit")?;
        self.extra.merge_from(&other.extra)
    }
}

/// ConfigMap volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVolumeSource {
    /// ConfigMap name
    pub name: String,
    /// File mode for projected keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,
    /// Allow the ConfigMap to be missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for ConfigMapVolumeSource {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.name, &other.name, "name")?;
        merge_field(&mut self.default_mode, &other.default_mode, "defaultMode")?;
        merge_field(&mut self.optional, &other.optional, "optional")?;
        self.extra.merge_from(&other.extra)
    }
}

/// Secret volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretVolumeSource {
    /// Secret name
    pub secret_name: String,
    /// File mode for projected keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl Merge for SecretVolumeSource {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.secret_name, &other.secret_name, "secretName")?;
        merge_field(&mut self.default_mode, &other.default_mode, "defaultMode")?;
        self.extra.merge_from(&other.extra)
    }
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl MergeKey for LocalObjectReference {
    fn merge_key(&self) -> String {
        self.name.clone()
    }
}

impl Merge for LocalObjectReference {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        self.extra.merge_from(&other.extra)
    }
}

// =============================================================================
// Scheduling
// =============================================================================

/// Toleration for a node taint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Exists or Equal
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    /// Taint value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Taint effect
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub effect: String,
    /// Seconds a NoExecute taint is tolerated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

/// Spread constraint across a topology domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpreadConstraint {
    /// Node label that defines the domain
    pub topology_key: String,
    /// Maximum allowed imbalance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_skew: Option<i32>,
    /// DoNotSchedule or ScheduleAnyway
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when_unsatisfiable: String,
    /// Selector for the pods counted in each domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<FreeForm>,
    /// Fields without a typed counterpart, carried through as written
    #[serde(flatten)]
    pub extra: FreeForm,
}

impl MergeKey for TopologySpreadConstraint {
    fn merge_key(&self) -> String {
        self.topology_key.clone()
    }
}

impl Merge for TopologySpreadConstraint {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.max_skew, &other.max_skew, "maxSkew")?;
        merge_field(
            &mut self.when_unsatisfiable,
            &other.when_unsatisfiable,
            "whenUnsatisfiable",
        )?;
        merge_field(
            &mut self.label_selector,
            &other.label_selector,
            "labelSelector",
        )?;
        self.extra.merge_from(&other.extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge_objects;
    use rstest::rstest;
    use serde_json::json;

    fn base_pod() -> Pod {
        let mut container = Container::new("buildkit", "moby/buildkit:latest");
        container.args = vec!["--addr".to_string(), "tcp://0.0.0.0:1234".to_string()];
        container.ports = vec![ContainerPort {
            name: "tcp".to_string(),
            container_port: 1234,
            protocol: "TCP".to_string(),
            ..Default::default()
        }];
        container.volume_mounts = vec![VolumeMount::new("buildkitd", "/var/lib/buildkit")];
        container.security_context = Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        });

        Pod {
            metadata: PodMeta {
                labels: BTreeMap::from([("app.kubernetes.io/name".into(), "buildkit".into())]),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![container],
                volumes: vec![Volume::empty_dir("buildkitd")],
                restart_policy: "Never".to_string(),
                termination_grace_period_seconds: Some(900),
                ..Default::default()
            },
        }
    }

    fn template_layer() -> Pod {
        let mut container = Container::new("buildkit", "");
        container.env = vec![EnvVar::new("BUILDKIT_STEP_LOG_MAX_SIZE", "-1")];
        container.volume_mounts = vec![VolumeMount::new("cache", "/cache")];

        Pod {
            metadata: PodMeta {
                labels: BTreeMap::from([("team".into(), "ci".into())]),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![container, Container::new("sidecar", "busybox")],
                volumes: vec![Volume::empty_dir("cache")],
                node_selector: BTreeMap::from([("pool".into(), "builders".into())]),
                ..Default::default()
            },
        }
    }

    fn identity_layer() -> Pod {
        Pod {
            metadata: PodMeta {
                generate_name: "my-build-".to_string(),
                namespace: "ci".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn merged(base: &Pod, layers: &[Pod]) -> Pod {
        let mut result = base.clone();
        merge_objects(&mut result, layers).unwrap();
        result
    }

    /// Story: Template layers add to the defaults without removing safety settings
    ///
    /// The template only names the container and adds env and mounts; the image,
    /// port, privileged flag and scratch volume from the defaults must survive.
    #[test]
    fn story_template_layer_is_additive() {
        let pod = merged(&base_pod(), &[template_layer()]);

        let buildkit = pod.container("buildkit").unwrap();
        assert_eq!(buildkit.image, "moby/buildkit:latest");
        assert_eq!(buildkit.ports[0].container_port, 1234);
        assert_eq!(
            buildkit.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        assert_eq!(buildkit.volume_mounts.len(), 2);
        assert_eq!(buildkit.env.len(), 1);

        assert_eq!(pod.spec.containers.len(), 2);
        assert_eq!(pod.spec.containers[1].name, "sidecar");
        assert_eq!(pod.spec.volumes.len(), 2);
        assert_eq!(pod.spec.restart_policy, "Never");
        assert_eq!(pod.metadata.labels.len(), 2);
        assert_eq!(pod.spec.node_selector["pool"], "builders");
    }

    #[test]
    fn test_keyed_container_fields_are_overridden() {
        let mut layer = Pod::default();
        let mut container = Container::new("buildkit", "moby/buildkit:v0.20.0-rootless");
        container.image_pull_policy = "Always".to_string();
        container.args = vec!["--debug".to_string()];
        layer.spec.containers = vec![container];

        let pod = merged(&base_pod(), &[layer]);
        let buildkit = pod.container("buildkit").unwrap();

        assert_eq!(buildkit.image, "moby/buildkit:v0.20.0-rootless");
        assert_eq!(buildkit.image_pull_policy, "Always");
        assert_eq!(buildkit.args, vec!["--debug".to_string()]);
    }

    /// Story: Layering in one call equals layering step by step
    #[rstest]
    #[case::template_then_identity(vec![template_layer(), identity_layer()])]
    #[case::identity_then_template(vec![identity_layer(), template_layer()])]
    #[case::repeated_layers(vec![template_layer(), template_layer(), identity_layer()])]
    fn story_merge_is_associative(#[case] layers: Vec<Pod>) {
        let all_at_once = merged(&base_pod(), &layers);

        let mut step_by_step = base_pod();
        for layer in &layers {
            step_by_step = merged(&step_by_step, std::slice::from_ref(layer));
        }

        assert_eq!(all_at_once, step_by_step);

        let (first, rest) = layers.split_first().unwrap();
        let grouped = merged(&merged(&base_pod(), std::slice::from_ref(first)), rest);
        assert_eq!(all_at_once, grouped);
    }

    /// Story: Every field set in the base survives a layer that leaves it unset
    #[rstest]
    #[case::empty_layer(Pod::default())]
    #[case::template(template_layer())]
    #[case::identity(identity_layer())]
    fn story_merge_never_removes_base_fields(#[case] layer: Pod) {
        let base = base_pod();
        let pod = merged(&base, &[layer]);

        let base_json = serde_json::to_value(&base).unwrap();
        let pod_json = serde_json::to_value(&pod).unwrap();
        assert_contains(&pod_json, &base_json, "");
    }

    fn assert_contains(actual: &serde_json::Value, expected: &serde_json::Value, path: &str) {
        match expected {
            serde_json::Value::Object(fields) => {
                for (key, value) in fields {
                    let field = actual
                        .get(key)
                        .unwrap_or_else(|| panic!("{path}.{key} was removed"));
                    assert_contains(field, value, &format!("{path}.{key}"));
                }
            }
            serde_json::Value::Array(items) => {
                let actual_items = actual.as_array().expect("array replaced by other shape");
                assert!(actual_items.len() >= items.len(), "{path} lost elements");
            }
            _ => assert!(!actual.is_null(), "{path} was cleared"),
        }
    }

    /// Story: Fields without a typed counterpart merge like free-form JSON
    #[test]
    fn story_untyped_fields_merge_additively() {
        let base: Pod = serde_json::from_value(json!({
            "spec": {"containers": [{
                "name": "buildkit",
                "startupProbe": {"periodSeconds": 5, "httpGet": {"path": "/healthz"}}
            }]}
        }))
        .unwrap();
        let layer: Pod = serde_json::from_value(json!({
            "spec": {
                "securityContext": {"fsGroup": 1000},
                "containers": [{"name": "buildkit", "startupProbe": {"periodSeconds": 10}}]
            }
        }))
        .unwrap();

        let pod = merged(&base, &[layer]);

        assert_eq!(
            pod.spec.containers[0].extra["startupProbe"],
            json!({"periodSeconds": 10, "httpGet": {"path": "/healthz"}})
        );
        assert_eq!(pod.spec.extra["securityContext"], json!({"fsGroup": 1000}));
    }

    #[test]
    fn test_failed_merge_leaves_base_untouched() {
        let mut base = base_pod();
        base.spec.affinity = Some(BTreeMap::from([(
            "nodeAffinity".to_string(),
            json!({"required": {}}),
        )]));
        let before = base.clone();

        let mut bad = template_layer();
        bad.spec.affinity = Some(BTreeMap::from([(
            "nodeAffinity".to_string(),
            json!({"required": []}),
        )]));

        let err = merge_objects(&mut base, &[bad]).unwrap_err();

        assert_eq!(base, before);
        assert!(err
            .to_string()
            .contains("spec.affinity.nodeAffinity.required"));
    }

    #[test]
    fn test_converts_to_api_pod_with_owner() {
        let owner = OwnerReference {
            api_version: "buildkit.dev/v1alpha1".to_string(),
            kind: "Buildkit".to_string(),
            name: "my-build".to_string(),
            uid: "1234".to_string(),
            controller: Some(true),
            ..Default::default()
        };
        let pod = merged(&base_pod(), &[identity_layer()]);

        let api_pod = pod.to_k8s(Some(owner)).unwrap();

        assert_eq!(api_pod.metadata.generate_name.as_deref(), Some("my-build-"));
        assert_eq!(api_pod.metadata.namespace.as_deref(), Some("ci"));
        assert_eq!(api_pod.metadata.owner_references.unwrap()[0].name, "my-build");
        let spec = api_pod.spec.unwrap();
        assert_eq!(spec.containers[0].name, "buildkit");
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }
}
