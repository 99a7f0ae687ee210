//! Gantry API types.
//!
//! These types describe the translated proxies that the control plane hands to
//! an edge proxy and the reports that come back out of translation. They're the
//! shared vocabulary between the translator that produces proxies, the status
//! reconciler in `gantry-core`, and the status plugins that write results back
//! onto Kubernetes objects.

mod proxy;
pub use proxy::{InvalidProxyKey, Proxy, ProxyKey};

mod report;
pub use report::{
    ProxyReport, ProxyState, ProxyWithReports, ResourceRef, ResourceReport, TranslationReports,
};

/// The label a translator sets on every proxy it produces. Its value is the
/// name of the controller that owns the proxy.
pub const CREATED_BY_LABEL: &str = "created_by";

/// The default controller name for proxies translated from Gateway API
/// resources.
pub const DEFAULT_CONTROLLER_NAME: &str = "gantry-kube-gateway";

/// The annotation carrying the translation generation a proxy was produced in.
///
/// The value is a base-10 unsigned integer. Proxies with a missing or
/// unparseable annotation are treated as generation `0`.
pub const GENERATION_ANNOTATION: &str = "gantry.dev/translation-generation";
