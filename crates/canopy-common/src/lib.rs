//! Common building blocks for Canopy: errors, the resource store adapter,
//! the reconciler, checksums, the task graph and bounded polling

#![deny(missing_docs)]

pub mod checksum;
pub mod error;
pub mod graph;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub mod wait;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix of pod-template annotations that carry content checksums
pub const CHECKSUM_ANNOTATION_PREFIX: &str = "checksum/";

/// Label key naming the logical instance that owns a resource
pub const INSTANCE_LABEL_KEY: &str = "canopy.io/instance";

/// Label key naming the component (data-store, front-end) of a resource
pub const COMPONENT_LABEL_KEY: &str = "canopy.io/component";

/// Label key identifying resources managed by canopy
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL_KEY`]
pub const MANAGED_BY_VALUE: &str = "canopy";
