use hyper::Method;

use super::{GateHandler, GateScope, RequestRegistry};

/// Register the cluster, node and cat APIs. The node stats and hot-threads
/// locations go ahead of the generic node info locations so `stats` is not
/// taken for a node name.
pub fn register(registry: &mut RequestRegistry) {
    registry.register(Box::new(GateHandler::new(
        "Home",
        vec![(Method::GET, "/"), (Method::HEAD, "/")],
        Vec::new(),
    )));
    registry.register(Box::new(GateHandler::new(
        "ClusterHealth",
        vec![
            (Method::GET, "/_cluster/health"),
            (Method::GET, "/_cluster/health/{indices}"),
        ],
        vec![("api/cluster/health", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "ClusterState",
        vec![
            (Method::GET, "/_cluster/state"),
            (Method::GET, "/_cluster/state/{keywords}"),
            (Method::GET, "/_cluster/state/{keywords}/{indices}"),
        ],
        vec![("api/cluster/state", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "ClusterStats",
        vec![
            (Method::GET, "/_cluster/stats"),
            (Method::GET, "/_cluster/stats/nodes/{nodes}"),
        ],
        vec![("api/cluster/stats", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "ClusterPendingTasks",
        vec![(Method::GET, "/_cluster/pending_tasks")],
        vec![("api/cluster/pendingTasks", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "ClusterReroute",
        vec![(Method::POST, "/_cluster/reroute")],
        vec![("api/cluster/reroute", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "ClusterSettings",
        vec![
            (Method::GET, "/_cluster/settings"),
            (Method::PUT, "/_cluster/settings"),
        ],
        vec![("api/cluster/settings", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "NodesStats",
        vec![
            (Method::GET, "/_nodes/stats"),
            (Method::GET, "/_nodes/{nodes}/stats"),
        ],
        vec![("api/cluster/nodes/stats", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "NodesHotThreads",
        vec![
            (Method::GET, "/_nodes/hot_threads"),
            (Method::GET, "/_nodes/{nodes}/hot_threads"),
        ],
        vec![("api/cluster/nodes/hotThreads", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "NodesInfo",
        vec![
            (Method::GET, "/_nodes"),
            (Method::GET, "/_nodes/{nodes}"),
        ],
        vec![("api/cluster/nodes/info", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "NodesShutdown",
        vec![
            (Method::POST, "/_shutdown"),
            (Method::POST, "/_cluster/nodes/_shutdown"),
            (Method::POST, "/_nodes/{nodes}/_shutdown"),
        ],
        vec![("api/cluster/nodes/shutdown", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "Cat",
        vec![
            (Method::GET, "/_cat"),
            (Method::GET, "/_cat/{keyword}"),
            (Method::GET, "/_cat/{keyword}/{identifier}"),
        ],
        vec![("api/cat", GateScope::Cluster)],
    )));
}

#[cfg(test)]
mod tests {
    use super::super::{RegistrySettings, RequestRegistry};
    use hyper::Method;

    #[test]
    fn test_node_routes_are_not_shadowed() {
        let registry = RequestRegistry::new(&RegistrySettings {
            kibana_validate_bypass: true,
        });

        let (handler, _) = registry.resolve(&Method::GET, "/_nodes/stats").unwrap();
        assert_eq!(handler.name(), "NodesStats");

        let (handler, params) = registry.resolve(&Method::GET, "/_nodes/node-1").unwrap();
        assert_eq!(handler.name(), "NodesInfo");
        assert_eq!(params.get("nodes").map(String::as_str), Some("node-1"));

        let (handler, _) = registry.resolve(&Method::GET, "/_cat/indices").unwrap();
        assert_eq!(handler.name(), "Cat");
    }
}
