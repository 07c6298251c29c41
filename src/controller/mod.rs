//! Controller implementations for the Buildkit CRDs
//!
//! Two controllers share one [`Context`]:
//! - [`buildkit`] keeps exactly one healthy pod per Buildkit instance
//! - [`template`] publishes the ConfigMaps each BuildkitTemplate derives
//!
//! Decisions are pure functions; the reconcile entry points only execute them
//! against the API through the client traits, which tests replace with mocks.

pub mod buildkit;
mod context;
mod runner;
pub mod template;

pub use buildkit::{KubeClient, KubeClientImpl, Outcome, PodPlan};
pub use context::{Context, ContextBuilder};
pub use runner::{build_controllers, ControllerFuture};
pub use template::{ArtifactClient, ArtifactClientImpl};
