//! Custom Resource Definitions for the Buildkit operator
//!
//! - [`Buildkit`]: a request for one running buildkitd
//! - [`BuildkitTemplate`]: the shared shape, limits and config instances build from

mod buildkit;
mod template;
mod types;

pub use buildkit::{Buildkit, BuildkitSpec, BuildkitStatus};
pub use template::{
    BuildkitTemplate, BuildkitTemplateSpec, BuildkitTemplateStatus, OtlpSettings,
    TemplateLifecycle, TemplateObservability, TemplateResources, TemplateScheduling,
    TEMPLATE_NAME_MAX_LENGTH,
};
pub use types::{
    set_condition, Condition, ConditionStatus, ResourceKind, ResourceRef, CONDITION_DEPLOYED,
    CONDITION_READY,
};
