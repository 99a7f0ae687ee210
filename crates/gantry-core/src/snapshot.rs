//! Point-in-time views of proxy configuration.

use std::collections::BTreeMap;

use enum_map::EnumMap;
use xds_api::{
    pb::{
        envoy::config::{
            cluster::v3 as xds_cluster, endpoint::v3 as xds_endpoint,
            listener::v3 as xds_listener, route::v3 as xds_route,
        },
        google::protobuf,
    },
    WellKnownTypes,
};

use crate::{Error, Result};

/// The kinds of xDS resource a [Snapshot] holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, enum_map::Enum, Hash)]
pub enum ResourceType {
    Listener,
    RouteConfiguration,
    Cluster,
    ClusterLoadAssignment,
}

impl ResourceType {
    fn from_type_url(type_url: &str) -> Option<Self> {
        match WellKnownTypes::from_type_url(type_url)? {
            WellKnownTypes::Listener => Some(Self::Listener),
            WellKnownTypes::RouteConfiguration => Some(Self::RouteConfiguration),
            WellKnownTypes::Cluster => Some(Self::Cluster),
            WellKnownTypes::ClusterLoadAssignment => Some(Self::ClusterLoadAssignment),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ResourceType::Listener => "Listener",
            ResourceType::RouteConfiguration => "RouteConfiguration",
            ResourceType::Cluster => "Cluster",
            ResourceType::ClusterLoadAssignment => "ClusterLoadAssignment",
        }
    }
}

/// A read-only, name-indexed set of Listeners, Clusters, RouteConfigurations
/// and endpoint sets.
///
/// Snapshots are populated by whatever is caching translated config and then
/// handed to the [bootstrap][crate::bootstrap] resolver. Every collection is
/// keyed by resource name, except endpoint sets which are keyed by the
/// `cluster_name` they were published under - the EDS service name a cluster
/// asks for.
///
/// Iteration is always in name order, so anything derived from a snapshot is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    listeners: BTreeMap<String, xds_listener::Listener>,
    clusters: BTreeMap<String, xds_cluster::Cluster>,
    routes: BTreeMap<String, xds_route::RouteConfiguration>,
    endpoints: BTreeMap<String, xds_endpoint::ClusterLoadAssignment>,
}

impl Snapshot {
    /// Build a snapshot from a list of `Any`-wrapped xDS resources, the way
    /// they'd arrive in a discovery response.
    ///
    /// Resources with a type that a snapshot doesn't hold are skipped.
    /// Resources that don't decode as their declared type are an error.
    pub fn from_resources(resources: impl IntoIterator<Item = protobuf::Any>) -> Result<Self> {
        let mut snapshot = Snapshot::default();

        for (idx, any) in resources.into_iter().enumerate() {
            let Some(resource_type) = ResourceType::from_type_url(&any.type_url) else {
                tracing::debug!(type_url = %any.type_url, idx, "skipping unknown resource type");
                continue;
            };

            let invalid = |e: prost::DecodeError| {
                Error::invalid_xds(
                    resource_type.name(),
                    format!("resources[{idx}]"),
                    format!("invalid proto: {e}"),
                )
            };

            match resource_type {
                ResourceType::Listener => {
                    snapshot.insert_listener(any.to_msg().map_err(invalid)?);
                }
                ResourceType::RouteConfiguration => {
                    snapshot.insert_route(any.to_msg().map_err(invalid)?);
                }
                ResourceType::Cluster => {
                    snapshot.insert_cluster(any.to_msg().map_err(invalid)?);
                }
                ResourceType::ClusterLoadAssignment => {
                    snapshot.insert_endpoints(any.to_msg().map_err(invalid)?);
                }
            }
        }

        Ok(snapshot)
    }

    pub fn listeners(&self) -> &BTreeMap<String, xds_listener::Listener> {
        &self.listeners
    }

    pub fn clusters(&self) -> &BTreeMap<String, xds_cluster::Cluster> {
        &self.clusters
    }

    pub fn routes(&self) -> &BTreeMap<String, xds_route::RouteConfiguration> {
        &self.routes
    }

    pub fn endpoints(&self) -> &BTreeMap<String, xds_endpoint::ClusterLoadAssignment> {
        &self.endpoints
    }

    /// The number of resources of each type in this snapshot.
    pub fn counts(&self) -> EnumMap<ResourceType, usize> {
        enum_map::enum_map! {
            ResourceType::Listener => self.listeners.len(),
            ResourceType::RouteConfiguration => self.routes.len(),
            ResourceType::Cluster => self.clusters.len(),
            ResourceType::ClusterLoadAssignment => self.endpoints.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().values().all(|n| *n == 0)
    }
}

// insert and with_ methods. inserting a resource with a name that's already
// present replaces it and returns the old value.
impl Snapshot {
    pub fn insert_listener(
        &mut self,
        listener: xds_listener::Listener,
    ) -> Option<xds_listener::Listener> {
        self.listeners.insert(listener.name.clone(), listener)
    }

    pub fn insert_cluster(
        &mut self,
        cluster: xds_cluster::Cluster,
    ) -> Option<xds_cluster::Cluster> {
        self.clusters.insert(cluster.name.clone(), cluster)
    }

    pub fn insert_route(
        &mut self,
        route: xds_route::RouteConfiguration,
    ) -> Option<xds_route::RouteConfiguration> {
        self.routes.insert(route.name.clone(), route)
    }

    pub fn insert_endpoints(
        &mut self,
        cla: xds_endpoint::ClusterLoadAssignment,
    ) -> Option<xds_endpoint::ClusterLoadAssignment> {
        self.endpoints.insert(cla.cluster_name.clone(), cla)
    }

    pub fn with_listener(mut self, listener: xds_listener::Listener) -> Self {
        self.insert_listener(listener);
        self
    }

    pub fn with_cluster(mut self, cluster: xds_cluster::Cluster) -> Self {
        self.insert_cluster(cluster);
        self
    }

    pub fn with_route(mut self, route: xds_route::RouteConfiguration) -> Self {
        self.insert_route(route);
        self
    }

    pub fn with_endpoints(mut self, cla: xds_endpoint::ClusterLoadAssignment) -> Self {
        self.insert_endpoints(cla);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bootstrap::placeholder_cluster;
    use crate::test::*;

    #[test]
    fn test_resource_type_from_type_url() {
        use prost::Name;

        assert_eq!(
            ResourceType::from_type_url(&xds_listener::Listener::type_url()),
            Some(ResourceType::Listener),
        );
        assert_eq!(
            ResourceType::from_type_url(&xds_endpoint::ClusterLoadAssignment::type_url()),
            Some(ResourceType::ClusterLoadAssignment),
        );
        assert_eq!(
            ResourceType::from_type_url("type.googleapis.com/envoy.config.core.v3.Node"),
            None,
        );
    }

    #[test]
    fn test_from_resources() {
        let resources = vec![
            any(&listener!("http", "http-routes")),
            any(&route_config!("http-routes", [vhost!("web", ["*"], [route!(default "web")])])),
            any(&cluster!(eds "web")),
            any(&cla!("web" => { "us-east-1" => ["10.0.0.1"] })),
            any(&xds_api::pb::envoy::config::core::v3::Node::default()),
        ];

        let snapshot = Snapshot::from_resources(resources).unwrap();
        let counts = snapshot.counts();
        assert_eq!(counts[ResourceType::Listener], 1);
        assert_eq!(counts[ResourceType::RouteConfiguration], 1);
        assert_eq!(counts[ResourceType::Cluster], 1);
        assert_eq!(counts[ResourceType::ClusterLoadAssignment], 1);

        assert!(snapshot.listeners().contains_key("http"));
        assert!(snapshot.routes().contains_key("http-routes"));
        assert!(snapshot.clusters().contains_key("web"));
        assert!(snapshot.endpoints().contains_key("web"));
    }

    #[test]
    fn test_from_resources_invalid_proto() {
        let garbage = protobuf::Any {
            type_url: <xds_cluster::Cluster as prost::Name>::type_url(),
            value: vec![0xff, 0xff, 0xff, 0xff].into(),
        };

        let err = Snapshot::from_resources(vec![any(&cluster!(eds "web")), garbage]).unwrap_err();
        match err {
            Error::InvalidXds {
                resource_type,
                resource_name,
                ..
            } => {
                assert_eq!(resource_type, "Cluster");
                assert_eq!(resource_name, "resources[1]");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_insert_replaces_by_name() {
        let mut snapshot = Snapshot::default();
        assert!(snapshot.is_empty());

        assert!(snapshot.insert_cluster(cluster!(eds "web")).is_none());
        let old = snapshot.insert_cluster(placeholder_cluster("web"));
        assert_eq!(old, Some(cluster!(eds "web")));
        assert_eq!(snapshot.clusters().len(), 1);
        assert!(!snapshot.is_empty());
    }
}
