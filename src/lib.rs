//! Buildkit Operator - ephemeral buildkitd instances built from shared templates
//!
//! A `BuildkitTemplate` describes how a buildkitd daemon should run in a
//! namespace. A `Buildkit` asks for one daemon from a template, optionally with
//! its own resources and labels, and gets back a `tcp://` endpoint once the
//! daemon is ready.
//!
//! # Architecture
//!
//! The desired pod is layered: built-in defaults, then the template, then the
//! instance identity. Layers are merged additively by typed merge rules keyed
//! per field, so a later layer refines an earlier one without erasing it.
//! Resources follow their own rules: instance requests merge over template
//! defaults and the result is capped by the template ceiling, tightened by the
//! instance ceiling.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Buildkit, BuildkitTemplate)
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`builder`] - Desired pod construction from an instance and its template
//! - [`artifacts`] - ConfigMaps derived from a template
//! - [`merge`] - Additive merge rules for layered specs
//! - [`resources`] - Resource requirement merging and ceilings
//! - [`quantity`] - Kubernetes quantity parsing and comparison
//! - [`workload`] - Pod types used while building the desired pod
//! - [`validation`] - Defaulting and admission rules for both CRDs
//! - [`config`] - Controller settings from flags and environment
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod artifacts;
pub mod builder;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod merge;
pub mod quantity;
pub mod resources;
pub mod validation;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout the operator.
// CRD defaults, the pod builder and test fixtures all read them from here.

/// Default buildkitd listen port
pub const DEFAULT_PORT: u16 = 1234;

/// Default buildkitd image when a template names none
pub const DEFAULT_IMAGE: &str = "moby/buildkit:latest";

/// Label identifying the application on every Buildkit pod
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Field manager for server-side apply and status patches
pub const FIELD_MANAGER: &str = "buildkit-operator";
