//! The core of the Gantry control plane.
//!
//! Two independent mechanisms live here:
//!
//! - Offline validation. A [Snapshot] of translated proxy config is resolved
//!   into a self-contained Envoy bootstrap with the [bootstrap] module and
//!   handed to an Envoy binary running in `validate` mode with a [Validator].
//!
//! - Status reconciliation. A [Reconciler] tracks which generation of config
//!   each proxy was last queued for, and routes translation reports back to
//!   the [StatusPlugin]s that were active for that generation.

mod error;
pub use crate::error::{Error, Result};

pub mod bootstrap;
pub use bootstrap::{Resolution, ResolvedBootstrap};

mod snapshot;
pub use snapshot::{ResourceType, Snapshot};

mod validate;
pub use validate::{
    Invocation, ProcessOutput, ProcessRunner, SystemRunner, Validator, ValidatorConfig,
    DEFAULT_ENVOY_PATH, ENVOY_PATH_ENV,
};

mod status;
pub use status::{PluginError, PluginRegistry, Reconciler, StatusContext, StatusPlugin};

/// Resolve a snapshot into a bootstrap and validate it with Envoy.
///
/// Returns the resolved bootstrap so callers can inspect what resolution had
/// to do, even when validation was skipped because there was no Envoy binary
/// to run.
pub fn validate_snapshot(validator: &Validator, snapshot: &Snapshot) -> Result<ResolvedBootstrap> {
    let resolved = bootstrap::resolve(snapshot)?;
    validator.validate(&resolved.to_json()?)?;
    Ok(resolved)
}
