use gantry_core::{Snapshot, Validator, ValidatorConfig};
use tracing_subscriber::EnvFilter;
use xds_api::pb::{
    envoy::{
        config::{
            cluster::v3 as xds_cluster, core::v3 as xds_core, listener::v3 as xds_listener,
            route::v3 as xds_route,
        },
        extensions::filters::network::http_connection_manager::v3 as xds_http,
    },
    google::protobuf,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let snapshot = Snapshot::default()
        .with_listener(listener("http", "http-routes"))
        .with_route(route_config("http-routes", "web"))
        .with_cluster(eds_cluster("api"));

    let resolved = match gantry_core::bootstrap::resolve(&snapshot) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("failed to resolve bootstrap: {e}");
            std::process::exit(1);
        }
    };

    println!("{:#?}", resolved.resolution);

    let validator = Validator::new(ValidatorConfig::from_env());
    match resolved.to_json().and_then(|json| validator.validate(&json)) {
        Ok(()) => println!("bootstrap is valid"),
        Err(gantry_core::Error::Rejected { output, .. }) => {
            eprintln!("envoy rejected the bootstrap:\n{output}");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("validation failed: {e}");
            std::process::exit(1);
        }
    }
}

fn ads() -> xds_core::ConfigSource {
    xds_core::ConfigSource {
        config_source_specifier: Some(xds_core::config_source::ConfigSourceSpecifier::Ads(
            Default::default(),
        )),
        resource_api_version: xds_core::ApiVersion::V3.into(),
        ..Default::default()
    }
}

fn listener(name: &str, route_name: &str) -> xds_listener::Listener {
    use xds_http::http_connection_manager::RouteSpecifier;

    let hcm = xds_http::HttpConnectionManager {
        stat_prefix: name.to_string(),
        route_specifier: Some(RouteSpecifier::Rds(xds_http::Rds {
            config_source: Some(ads()),
            route_config_name: route_name.to_string(),
        })),
        ..Default::default()
    };

    xds_listener::Listener {
        name: name.to_string(),
        filter_chains: vec![xds_listener::FilterChain {
            filters: vec![xds_listener::Filter {
                name: gantry_core::bootstrap::HTTP_CONNECTION_MANAGER.to_string(),
                config_type: Some(xds_listener::filter::ConfigType::TypedConfig(
                    protobuf::Any::from_msg(&hcm).unwrap(),
                )),
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn route_config(name: &str, cluster: &str) -> xds_route::RouteConfiguration {
    use xds_route::route_action::ClusterSpecifier;

    let route = xds_route::Route {
        r#match: Some(xds_route::RouteMatch {
            path_specifier: Some(xds_route::route_match::PathSpecifier::Prefix("/".to_string())),
            ..Default::default()
        }),
        action: Some(xds_route::route::Action::Route(xds_route::RouteAction {
            cluster_specifier: Some(ClusterSpecifier::Cluster(cluster.to_string())),
            ..Default::default()
        })),
        ..Default::default()
    };

    xds_route::RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vec![xds_route::VirtualHost {
            name: "default".to_string(),
            domains: vec!["*".to_string()],
            routes: vec![route],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn eds_cluster(name: &str) -> xds_cluster::Cluster {
    use xds_cluster::cluster::{ClusterDiscoveryType, DiscoveryType, EdsClusterConfig};

    xds_cluster::Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds.into())),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: Some(ads()),
            service_name: String::new(),
        }),
        ..Default::default()
    }
}
