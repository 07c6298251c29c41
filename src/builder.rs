//! Desired pod for a Buildkit instance
//!
//! The pod is assembled from layers merged in order:
//! 1. overridable defaults derived from the template (image, args, probes,
//!    execution mode, artifact mounts, default resources)
//! 2. the template's structured fields (image, scheduling, lifecycle, OTLP env)
//! 3. the template's partial pod, if any
//! 4. identity: `generateName: <instance>-` and the instance namespace
//!
//! Templates are defaulted and validated before any layer is built, so a
//! template that skipped admission still yields the same pod.
//!
//! Resources are settled last: the instance override is merged onto the
//! container's resources and the result is capped by the template ceiling,
//! tightened by the instance's own ceiling.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::artifacts::{self, ArtifactKind};
use crate::crd::{Buildkit, BuildkitTemplate};
use crate::merge::merge_objects;
use crate::resources::{self, ResourceRequirements};
use crate::validation;
use crate::workload::{
    Container, ContainerPort, EnvVar, ExecAction, GrpcAction, Lifecycle, LifecycleHandler, Pod,
    PodMeta, PodSpec, Probe, SecurityContext, SecurityProfile, Volume, VolumeMount,
};
use crate::{Error, APP_NAME_LABEL, DEFAULT_IMAGE};

/// Name of the buildkitd container
pub const BUILDKIT_CONTAINER: &str = "buildkit";

/// Scratch volume holding buildkitd state
const STATE_VOLUME: &str = "buildkitd";

/// Volume projecting the daemon config artifact
const CONFIG_VOLUME: &str = "config";

/// Volume projecting the lifecycle script artifact
const SCRIPTS_VOLUME: &str = "scripts";

/// Where lifecycle scripts are mounted
const SCRIPTS_MOUNT_PATH: &str = "/buildkit-scripts";

/// rwxr-xr-x, so the scripts can be executed
const SCRIPTS_MODE: i32 = 0o755;

/// UID and GID of the user in the rootless image
const ROOTLESS_USER_ID: i64 = 1000;

/// Termination grace period giving in-flight builds time to finish
const TERMINATION_GRACE_SECONDS: i64 = 900;

/// Directory layout of buildkitd inside the container
struct DaemonLayout {
    state_dir: &'static str,
    config_dir: &'static str,
}

const ROOTLESS_LAYOUT: DaemonLayout = DaemonLayout {
    state_dir: "/home/user/.local/share/buildkit",
    config_dir: "/home/user/.config/buildkit",
};

const PRIVILEGED_LAYOUT: DaemonLayout = DaemonLayout {
    state_dir: "/var/lib/buildkit",
    config_dir: "/etc/buildkit",
};

/// Read access to BuildkitTemplates
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TemplateLookup: Send + Sync {
    /// Fetch a template, returning `None` if it does not exist
    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildkitTemplate>, Error>;
}

/// Builds the desired pod for one Buildkit instance
pub struct PodBuilder<'a> {
    buildkit: &'a Buildkit,
    templates: &'a dyn TemplateLookup,
}

impl<'a> PodBuilder<'a> {
    /// Create a builder for the given instance
    pub fn new(buildkit: &'a Buildkit, templates: &'a dyn TemplateLookup) -> Self {
        Self {
            buildkit,
            templates,
        }
    }

    /// Resolve the instance's template and build its pod
    ///
    /// A missing template is reported as [`Error::TemplateNotFound`].
    pub async fn build_pod(&self) -> Result<Pod, Error> {
        let namespace = self.buildkit.namespace().ok_or(Error::MissingNamespace)?;
        let template_name = &self.buildkit.spec.template;

        let template = self
            .templates
            .get_template(&namespace, template_name)
            .await?
            .ok_or_else(|| Error::template_not_found(&namespace, template_name))?;

        debug!(template = %template_name, "resolved template");
        build_pod(self.buildkit, &template)
    }
}

/// Build the pod for an instance from an already resolved template
///
/// The template is defaulted first. A template breaking a template rule is
/// refused with [`Error::Validation`].
pub fn build_pod(buildkit: &Buildkit, template: &BuildkitTemplate) -> Result<Pod, Error> {
    let mut template = template.clone();
    validation::default_template(&mut template.spec);
    validation::validate_template(&template).into_result()?;
    let template = &template;

    let mut pod = defaults(buildkit, template);

    let layers = [
        template_fields(template),
        template.spec.pod_template.clone().unwrap_or_default(),
        identity(buildkit),
    ];
    merge_objects(&mut pod, &layers)?;

    let container = pod
        .container_mut(BUILDKIT_CONTAINER)
        .ok_or_else(|| Error::internal("buildkit container missing after merge"))?;
    let current = container.resources.clone().unwrap_or_default();
    let effective = effective_resources(buildkit, template, &current);
    container.resources = (!effective.is_empty()).then_some(effective);

    Ok(pod)
}

/// Instance override merged onto `current`, capped by the combined ceiling
fn effective_resources(
    buildkit: &Buildkit,
    template: &BuildkitTemplate,
    current: &ResourceRequirements,
) -> ResourceRequirements {
    let merged = resources::merge(buildkit.spec.resources.as_ref(), current);

    let ceiling =
        resources::tighten_ceiling(&template.spec.resources.maximum, &buildkit.spec.maximum);
    if ceiling.is_empty() {
        return merged;
    }
    resources::with_maximums(&ceiling, [&merged])
}

/// Defaults every field of which later layers may override
fn defaults(buildkit: &Buildkit, template: &BuildkitTemplate) -> Pod {
    let spec = &template.spec;
    let port = spec.port;
    let layout = if spec.rootless {
        &ROOTLESS_LAYOUT
    } else {
        &PRIVILEGED_LAYOUT
    };

    let mut container = Container::new(BUILDKIT_CONTAINER, DEFAULT_IMAGE);
    container.args = vec!["--addr".to_string(), format!("tcp://0.0.0.0:{port}")];
    container.ports = vec![ContainerPort {
        name: "tcp".to_string(),
        container_port: port,
        protocol: "TCP".to_string(),
        ..Default::default()
    }];
    container.readiness_probe = Some(grpc_probe(port, 15, 2));
    container.liveness_probe = Some(grpc_probe(port, 30, 6));
    container.volume_mounts = vec![VolumeMount::new(STATE_VOLUME, layout.state_dir)];
    if !spec.resources.default.is_empty() {
        container.resources = Some(spec.resources.default.clone());
    }

    if spec.rootless {
        container.args.push("--oci-worker-no-process-sandbox".to_string());
        container.security_context = Some(SecurityContext {
            seccomp_profile: Some(SecurityProfile::unconfined()),
            app_armor_profile: Some(SecurityProfile::unconfined()),
            run_as_user: Some(ROOTLESS_USER_ID),
            run_as_group: Some(ROOTLESS_USER_ID),
            ..Default::default()
        });
    } else {
        container.security_context = Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        });
    }

    if spec.observability.debug_logging {
        container.args.push("--debug".to_string());
    }

    let mut volumes = vec![Volume::empty_dir(STATE_VOLUME)];

    if let Some(config) = artifacts::derive(template, ArtifactKind::DaemonConfig) {
        volumes.push(Volume::config_map(CONFIG_VOLUME, config.name, None));
        container
            .volume_mounts
            .push(VolumeMount::new(CONFIG_VOLUME, layout.config_dir));
    }

    if let Some(scripts) = artifacts::derive(template, ArtifactKind::Scripts) {
        volumes.push(Volume::config_map(
            SCRIPTS_VOLUME,
            scripts.name,
            Some(SCRIPTS_MODE),
        ));
        container
            .volume_mounts
            .push(VolumeMount::new(SCRIPTS_VOLUME, SCRIPTS_MOUNT_PATH));
        container.lifecycle = Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: vec![
                        "/bin/sh".to_string(),
                        format!(
                            "{SCRIPTS_MOUNT_PATH}/{}",
                            ArtifactKind::Scripts.file_name()
                        ),
                    ],
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut labels = BTreeMap::from([(APP_NAME_LABEL.to_string(), "buildkit".to_string())]);
    labels.extend(buildkit.spec.labels.clone());

    Pod {
        metadata: PodMeta {
            labels,
            annotations: buildkit.spec.annotations.clone(),
            ..Default::default()
        },
        spec: PodSpec {
            containers: vec![container],
            volumes,
            restart_policy: "Never".to_string(),
            termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
            ..Default::default()
        },
    }
}

fn grpc_probe(port: i32, period_seconds: i32, failure_threshold: i32) -> Probe {
    Probe {
        grpc: Some(GrpcAction {
            port,
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Layer built from the template's structured fields
fn template_fields(template: &BuildkitTemplate) -> Pod {
    let spec = &template.spec;

    let mut container = Container::new(BUILDKIT_CONTAINER, spec.image.clone());
    container.image_pull_policy = spec.image_pull_policy.clone();
    container.command = spec.command.clone();
    if let Some(otlp) = &spec.observability.otlp {
        container
            .env
            .push(EnvVar::new("OTEL_SERVICE_NAME", otlp.service_name.clone()));
        if !otlp.resource_attributes.is_empty() {
            container.env.push(EnvVar::new(
                "OTEL_RESOURCE_ATTRIBUTES",
                otlp.resource_attributes_env(),
            ));
        }
    }

    let scheduling = &spec.scheduling;
    let lifecycle = &spec.lifecycle;

    Pod {
        metadata: PodMeta {
            labels: spec.pod_labels.clone(),
            annotations: spec.pod_annotations.clone(),
            ..Default::default()
        },
        spec: PodSpec {
            containers: vec![container],
            restart_policy: lifecycle.restart_policy.clone(),
            termination_grace_period_seconds: lifecycle.termination_grace_period_seconds,
            active_deadline_seconds: lifecycle.active_deadline_seconds,
            service_account_name: spec.service_account_name.clone(),
            node_selector: scheduling.node_selector.clone(),
            tolerations: scheduling.tolerations.clone(),
            affinity: scheduling.affinity.clone(),
            priority_class_name: scheduling.priority_class_name.clone(),
            topology_spread_constraints: scheduling.topology_spread_constraints.clone(),
            host_users: spec.host_users,
            ..Default::default()
        },
    }
}

/// Layer pinning the pod's identity to the instance
fn identity(buildkit: &Buildkit) -> Pod {
    Pod {
        metadata: PodMeta {
            generate_name: format!("{}-", buildkit.name_any()),
            namespace: buildkit.namespace().unwrap_or_default(),
            ..Default::default()
        },
        ..Default::default()
    }
}
