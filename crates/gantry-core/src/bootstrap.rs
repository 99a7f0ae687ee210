//! Static bootstrap generation.
//!
//! Envoy's `validate` mode only accepts a bootstrap: it has no management
//! server to talk to, so anything the control plane would normally serve over
//! xDS has to be inlined into static config before Envoy can check it. This
//! module takes a [Snapshot] and resolves it into a single self-contained
//! [Bootstrap][xds_bootstrap::Bootstrap]:
//!
//! - Connection managers that reference a RouteConfiguration over RDS get that
//!   RouteConfiguration inlined.
//! - Clusters that get their endpoints over EDS get the matching endpoint set
//!   inlined.
//! - Clusters that a route targets but that don't exist are replaced with an
//!   empty placeholder. Envoy refuses to start with a route pointing at an
//!   undefined cluster.
//!
//! References that can't be resolved from the snapshot are left alone. Envoy
//! will reject them during validation with a far better error message than
//! anything we could produce here.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage};
use xds_api::pb::{
    envoy::{
        config::{
            bootstrap::v3 as xds_bootstrap,
            cluster::v3 as xds_cluster,
            core::v3 as xds_core,
            endpoint::v3 as xds_endpoint,
            listener::v3 as xds_listener,
            route::v3 as xds_route,
        },
        extensions::filters::network::http_connection_manager::v3 as xds_http,
    },
    google::protobuf,
};

use crate::{snapshot::Snapshot, Error, Result};

/// The well-known name of Envoy's HTTP connection manager network filter.
pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";

/// The node id every generated bootstrap identifies as.
pub const VALIDATION_NODE_ID: &str = "validation-node-id";

/// The node cluster every generated bootstrap identifies as.
pub const VALIDATION_CLUSTER: &str = "validation-cluster";

const ADMIN_ADDRESS: &str = "127.0.0.1";
const ADMIN_PORT: u32 = 19000;

static HCM_TYPE_URL: Lazy<String> =
    Lazy::new(<xds_http::HttpConnectionManager as prost::Name>::type_url);

static XDS_DESCRIPTORS: Lazy<DescriptorPool> = Lazy::new(|| {
    DescriptorPool::decode(xds_api::FILE_DESCRIPTOR_SET)
        .expect("xds-api shipped an invalid descriptor set: this is a bug in Gantry")
});

/// What resolving a [Snapshot] had to do to make it self-contained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// The number of RDS references replaced with an inline RouteConfiguration.
    pub inlined_routes: usize,

    /// The number of EDS clusters rewritten to carry their endpoints inline.
    pub resolved_endpoints: usize,

    /// The names of placeholder clusters added for routes targeting clusters
    /// that don't exist, in name order.
    pub placeholders: Vec<String>,

    /// RouteConfiguration names referenced by a listener but missing from the
    /// snapshot.
    pub missing_routes: BTreeSet<String>,

    /// EDS service names referenced by a cluster but missing from the
    /// snapshot.
    pub missing_endpoints: BTreeSet<String>,
}

/// A bootstrap built from a [Snapshot], and a summary of how it was built.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBootstrap {
    pub bootstrap: xds_bootstrap::Bootstrap,
    pub resolution: Resolution,
}

impl ResolvedBootstrap {
    /// Render this bootstrap as JSON.
    pub fn to_json(&self) -> Result<String> {
        to_json(&self.bootstrap)
    }
}

/// Resolve a snapshot into a static bootstrap and render it as JSON.
///
/// JSON is valid YAML, so the result can be handed to Envoy as-is.
pub fn from_snapshot(snapshot: &Snapshot) -> Result<String> {
    resolve(snapshot)?.to_json()
}

/// Resolve a snapshot into a static bootstrap with no references to anything
/// outside of the bootstrap itself.
pub fn resolve(snapshot: &Snapshot) -> Result<ResolvedBootstrap> {
    let counts = snapshot.counts();
    tracing::debug!(
        listeners = counts[crate::ResourceType::Listener],
        clusters = counts[crate::ResourceType::Cluster],
        routes = counts[crate::ResourceType::RouteConfiguration],
        endpoints = counts[crate::ResourceType::ClusterLoadAssignment],
        "resolving bootstrap from snapshot",
    );

    let mut resolution = Resolution::default();

    // every cluster name targeted by a route on any listener. clusters get
    // removed as they're found, so whatever is left at the end needs a
    // placeholder.
    let mut routed_clusters = BTreeSet::new();

    let mut listeners = Vec::with_capacity(snapshot.listeners().len());
    for listener in snapshot.listeners().values() {
        let mut listener = listener.clone();
        inline_listener_routes(
            &mut listener,
            snapshot.routes(),
            &mut routed_clusters,
            &mut resolution,
        )?;
        listeners.push(listener);
    }

    let mut clusters = Vec::with_capacity(snapshot.clusters().len() + routed_clusters.len());
    for cluster in snapshot.clusters().values() {
        routed_clusters.remove(&cluster.name);
        clusters.push(inline_cluster_endpoints(
            cluster.clone(),
            snapshot.endpoints(),
            &mut resolution,
        ));
    }

    for name in routed_clusters {
        tracing::trace!(cluster = %name, "adding placeholder cluster");
        clusters.push(placeholder_cluster(&name));
        resolution.placeholders.push(name);
    }

    tracing::debug!(
        inlined_routes = resolution.inlined_routes,
        resolved_endpoints = resolution.resolved_endpoints,
        placeholders = resolution.placeholders.len(),
        missing_routes = ?resolution.missing_routes,
        missing_endpoints = ?resolution.missing_endpoints,
        "resolved bootstrap",
    );

    Ok(ResolvedBootstrap {
        bootstrap: assemble(listeners, clusters),
        resolution,
    })
}

/// Build a bootstrap directly from a set of listeners and clusters and render
/// it as JSON. Nothing gets resolved, the resources are used exactly as given.
pub fn from_resources(
    listeners: Vec<xds_listener::Listener>,
    clusters: Vec<xds_cluster::Cluster>,
) -> Result<String> {
    to_json(&assemble(listeners, clusters))
}

/// Build a bootstrap that exists only to carry a single HTTP filter's
/// per-route config and render it as JSON.
///
/// The bootstrap has one listener with one connection manager whose inline
/// route table has one catch-all virtual host. The virtual host carries
/// `typed_config` as its `typed_per_filter_config` for `filter_name`, which is
/// enough for Envoy to validate the filter config in isolation.
pub fn from_filter(filter_name: &str, typed_config: protobuf::Any) -> Result<String> {
    use xds_http::http_connection_manager::RouteSpecifier;

    tracing::debug!(filter_name, "building bootstrap for filter");

    let vhost = xds_route::VirtualHost {
        name: "placeholder_host".to_string(),
        domains: vec!["*".to_string()],
        typed_per_filter_config: [(filter_name.to_string(), typed_config)]
            .into_iter()
            .collect(),
        ..Default::default()
    };

    let hcm = xds_http::HttpConnectionManager {
        stat_prefix: "placeholder".to_string(),
        route_specifier: Some(RouteSpecifier::RouteConfig(xds_route::RouteConfiguration {
            virtual_hosts: vec![vhost],
            ..Default::default()
        })),
        ..Default::default()
    };

    let listener = xds_listener::Listener {
        name: "placeholder_listener".to_string(),
        address: Some(socket_address("0.0.0.0", 8081)),
        filter_chains: vec![xds_listener::FilterChain {
            name: "placeholder_filter_chain".to_string(),
            filters: vec![xds_listener::Filter {
                name: HTTP_CONNECTION_MANAGER.to_string(),
                config_type: Some(xds_listener::filter::ConfigType::TypedConfig(
                    protobuf::Any::from_msg(&hcm)?,
                )),
            }],
            ..Default::default()
        }],
        ..Default::default()
    };

    from_resources(vec![listener], vec![])
}

/// Render a bootstrap as proto3 JSON.
///
/// Rendering goes through the full xDS descriptor set, so every `Any` in the
/// bootstrap is expanded into its message fields no matter what type it holds.
pub fn to_json(bootstrap: &xds_bootstrap::Bootstrap) -> Result<String> {
    let invalid = |message: String| Error::invalid_xds("Bootstrap", "", message);

    let descriptor = XDS_DESCRIPTORS
        .get_message_by_name(&<xds_bootstrap::Bootstrap as prost::Name>::full_name())
        .ok_or_else(|| invalid("no descriptor for Bootstrap".to_string()))?;
    let message = DynamicMessage::decode(descriptor, bootstrap.encode_to_vec().as_slice())
        .map_err(|e| invalid(format!("invalid proto: {e}")))?;

    let json = serde_json::to_string(&message)?;
    tracing::trace!(json_length = json.len(), "rendered bootstrap");
    Ok(json)
}

/// A static cluster with no endpoints.
///
/// Routes to a placeholder cluster fail with a 503 instead of preventing
/// Envoy from starting at all. Every missing name gets its own placeholder,
/// since features like weighted clusters need distinct targets.
pub(crate) fn placeholder_cluster(name: &str) -> xds_cluster::Cluster {
    use xds_cluster::cluster::{ClusterDiscoveryType, DiscoveryType};

    xds_cluster::Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Static.into())),
        load_assignment: Some(xds_endpoint::ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn assemble(
    listeners: Vec<xds_listener::Listener>,
    clusters: Vec<xds_cluster::Cluster>,
) -> xds_bootstrap::Bootstrap {
    xds_bootstrap::Bootstrap {
        node: Some(xds_core::Node {
            id: VALIDATION_NODE_ID.to_string(),
            cluster: VALIDATION_CLUSTER.to_string(),
            ..Default::default()
        }),
        admin: Some(xds_bootstrap::Admin {
            address: Some(socket_address(ADMIN_ADDRESS, ADMIN_PORT)),
            ..Default::default()
        }),
        static_resources: Some(xds_bootstrap::bootstrap::StaticResources {
            listeners,
            clusters,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn socket_address(address: &str, port: u32) -> xds_core::Address {
    xds_core::Address {
        address: Some(xds_core::address::Address::SocketAddress(
            xds_core::SocketAddress {
                address: address.to_string(),
                port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(port)),
                ..Default::default()
            },
        )),
    }
}

/// Inline RDS references on every connection manager in a listener: every
/// filter chain, the default filter chain, and the api listener if there is
/// one.
fn inline_listener_routes(
    listener: &mut xds_listener::Listener,
    routes: &BTreeMap<String, xds_route::RouteConfiguration>,
    routed_clusters: &mut BTreeSet<String>,
    resolution: &mut Resolution,
) -> Result<()> {
    use xds_listener::filter::ConfigType;

    let listener_name = listener.name.clone();

    let filter_chains = listener
        .filter_chains
        .iter_mut()
        .enumerate()
        .map(|(i, fc)| (format!("filter_chains[{i}]"), fc))
        .chain(
            listener
                .default_filter_chain
                .as_mut()
                .map(|fc| ("default_filter_chain".to_string(), fc)),
        );

    for (fc_field, fc) in filter_chains {
        let mut has_hcm = false;
        for (i, filter) in fc.filters.iter_mut().enumerate() {
            let Some(ConfigType::TypedConfig(typed_config)) = &mut filter.config_type else {
                continue;
            };
            if !is_hcm(typed_config) {
                continue;
            }

            has_hcm = true;
            let field = format!("{fc_field}.filters[{i}]");
            inline_hcm_routes(
                &listener_name,
                &field,
                typed_config,
                routes,
                routed_clusters,
                resolution,
            )?;
        }

        if !has_hcm {
            tracing::trace!(
                listener = %listener_name,
                filter_chain = %fc.name,
                "no HttpConnectionManager on filter chain, skipping",
            );
        }
    }

    if let Some(typed_config) = listener
        .api_listener
        .as_mut()
        .and_then(|l| l.api_listener.as_mut())
        .filter(|any| is_hcm(any))
    {
        inline_hcm_routes(
            &listener_name,
            "api_listener",
            typed_config,
            routes,
            routed_clusters,
            resolution,
        )?;
    }

    Ok(())
}

fn is_hcm(any: &protobuf::Any) -> bool {
    any.type_url == *HCM_TYPE_URL
}

/// Inline the RDS route config on a single `Any`-wrapped connection manager,
/// re-encoding it in place if anything changed.
fn inline_hcm_routes(
    listener_name: &str,
    field: &str,
    typed_config: &mut protobuf::Any,
    routes: &BTreeMap<String, xds_route::RouteConfiguration>,
    routed_clusters: &mut BTreeSet<String>,
    resolution: &mut Resolution,
) -> Result<()> {
    use xds_http::http_connection_manager::RouteSpecifier;

    let mut hcm: xds_http::HttpConnectionManager = typed_config.to_msg().map_err(|e| {
        Error::invalid_xds(
            "Listener",
            listener_name,
            format!("{field}: invalid HttpConnectionManager: {e}"),
        )
    })?;

    let route_config = match &hcm.route_specifier {
        Some(RouteSpecifier::Rds(rds)) if !rds.route_config_name.is_empty() => {
            let Some(route_config) = routes.get(&rds.route_config_name) else {
                tracing::debug!(
                    listener = %listener_name,
                    route_config = %rds.route_config_name,
                    "RouteConfiguration not found in snapshot, leaving RDS reference",
                );
                resolution
                    .missing_routes
                    .insert(rds.route_config_name.clone());
                return Ok(());
            };
            route_config
        }
        // routes that are already inline can still point at clusters that
        // don't exist.
        Some(RouteSpecifier::RouteConfig(route_config)) => {
            routed_clusters.extend(cluster_names(route_config));
            return Ok(());
        }
        _ => return Ok(()),
    };

    tracing::trace!(
        listener = %listener_name,
        route_config = %route_config.name,
        virtual_hosts = route_config.virtual_hosts.len(),
        "inlining RouteConfiguration",
    );
    routed_clusters.extend(cluster_names(route_config));
    hcm.route_specifier = Some(RouteSpecifier::RouteConfig(route_config.clone()));

    *typed_config = protobuf::Any::from_msg(&hcm)?;
    resolution.inlined_routes += 1;
    Ok(())
}

/// Every cluster targeted by a route in a RouteConfiguration, either directly
/// or as part of a set of weighted clusters.
fn cluster_names(route_config: &xds_route::RouteConfiguration) -> BTreeSet<String> {
    use xds_route::route_action::ClusterSpecifier;

    let mut clusters = BTreeSet::new();
    for vhost in &route_config.virtual_hosts {
        for route in &vhost.routes {
            let Some(xds_route::route::Action::Route(route_action)) = &route.action else {
                continue;
            };

            match &route_action.cluster_specifier {
                Some(ClusterSpecifier::Cluster(cluster)) if !cluster.is_empty() => {
                    clusters.insert(cluster.clone());
                }
                Some(ClusterSpecifier::WeightedClusters(weighted_clusters)) => {
                    for w in &weighted_clusters.clusters {
                        clusters.insert(w.name.clone());
                    }
                }
                _ => continue,
            }
        }
    }
    clusters
}

fn is_eds(cluster: &xds_cluster::Cluster) -> bool {
    use xds_cluster::cluster::{ClusterDiscoveryType, DiscoveryType};

    let eds_type = i32::from(DiscoveryType::Eds);
    cluster.eds_cluster_config.is_some()
        || matches!(
            cluster.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(t)) if t == eds_type
        )
}

/// Rewrite an EDS cluster to carry its endpoints inline, if the snapshot has
/// them. The EDS service name defaults to the cluster name.
fn inline_cluster_endpoints(
    mut cluster: xds_cluster::Cluster,
    endpoints: &BTreeMap<String, xds_endpoint::ClusterLoadAssignment>,
    resolution: &mut Resolution,
) -> xds_cluster::Cluster {
    use xds_cluster::cluster::{ClusterDiscoveryType, DiscoveryType};

    if !is_eds(&cluster) {
        return cluster;
    }

    let service_name = match &cluster.eds_cluster_config {
        Some(eds) if !eds.service_name.is_empty() => eds.service_name.clone(),
        _ => cluster.name.clone(),
    };

    let Some(cla) = endpoints.get(&service_name) else {
        tracing::debug!(
            cluster = %cluster.name,
            %service_name,
            "no endpoints found for EDS cluster",
        );
        resolution.missing_endpoints.insert(service_name);
        return cluster;
    };

    tracing::trace!(
        cluster = %cluster.name,
        %service_name,
        endpoints = cla.endpoints.len(),
        "inlining endpoints",
    );
    cluster.load_assignment = Some(cla.clone());
    cluster.eds_cluster_config = None;
    cluster.cluster_discovery_type =
        Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns.into()));
    resolution.resolved_endpoints += 1;

    cluster
}
