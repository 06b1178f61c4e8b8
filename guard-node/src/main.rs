use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::describe_counter;
use tracing::{error, info, warn};

use guard_node::auth::backends::{
    AuthenticationBackend, ElasticsearchRoleBackend, GroupBackend, LdapAuthenticationBackend,
    LdapUsergroupBackend,
};
use guard_node::auth::AuthEngine;
use guard_node::config::GuardConfig;
use guard_node::proxy::{ProxyServer, ProxyState};
use guard_node::request::{RegistrySettings, RequestRegistry};
use guard_node::upstream::UpstreamPool;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guard_node=info".into()),
        )
        .with_target(false)
        .init();

    info!(
        "Starting ElasticGuard v{} - Authorizing Elasticsearch Proxy",
        env!("CARGO_PKG_VERSION")
    );

    let config_name =
        std::env::var("GUARD_CONFIG").unwrap_or_else(|_| "elasticguard".to_string());

    let config_paths = vec![
        config_name.clone(),
        format!("guard-node/config/{config_name}"),
        "/etc/elasticguard/elasticguard".to_string(),
    ];

    let mut config = None;
    for config_path in &config_paths {
        match GuardConfig::from_file(config_path) {
            Ok(loaded) => {
                info!("Configuration loaded from {config_path}");
                config = Some(loaded);
                break;
            }
            Err(e) => {
                tracing::debug!("Failed to load config from {config_path}: {e}");
            }
        }
    }

    let config = config.unwrap_or_else(|| {
        warn!("No configuration file found, using defaults");
        GuardConfig::default()
    });

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(2);
    }

    info!(
        listen_addr = config.listen_addr().as_str(),
        nodes = config.elasticsearch_nodes().join(", "),
        secured = config.tls_enabled(),
        group_backend = config.group_backend.backend.as_str(),
        "ElasticGuard initialized"
    );

    // Upstream pool with background health probing
    let upstream = Arc::new(UpstreamPool::new(
        config.elasticsearch_nodes(),
        config.upstream_timeout(),
    ));
    UpstreamPool::start_health_probes(upstream.clone(), config.health_probe_interval());

    // Role backend reads role documents from the configuration index
    let role_backend = Arc::new(
        ElasticsearchRoleBackend::new(
            config.elasticsearch_nodes(),
            config.authorization.config_index.clone(),
            config.upstream_timeout(),
        )
        .context("Failed to initialize the role backend")?,
    );

    // Group and authentication backends per configuration
    let mut group_backends: Vec<Arc<dyn GroupBackend>> = Vec::new();
    let mut auth_backends: Vec<Arc<dyn AuthenticationBackend>> = Vec::new();
    let flavor = config.group_backend.backend.clone();
    if flavor != "none" {
        let ldap = config
            .ldap
            .clone()
            .context("A LDAP group backend requires the ldap section")?;
        group_backends.push(Arc::new(LdapUsergroupBackend::new(
            flavor.clone(),
            ldap.clone(),
        )));
        auth_backends.push(Arc::new(LdapAuthenticationBackend::new(flavor, ldap)));
    }

    let auth = Arc::new(AuthEngine::new(
        config.proxy.allow_from.clone(),
        config.proxy.trusted_proxies.clone(),
        config.authorization.config_index.clone(),
        role_backend,
        auth_backends,
        group_backends,
    ));

    let registry = Arc::new(RequestRegistry::new(&RegistrySettings {
        kibana_validate_bypass: config.authorization.kibana_validate_bypass,
    }));

    if config.metrics.enabled {
        initialize_metrics();
        let metrics_addr: SocketAddr = config
            .metrics
            .listen_addr
            .parse()
            .context("Invalid metrics listen address")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(metrics_addr = %metrics_addr, "Prometheus metrics server started");
    }

    let server = ProxyServer::new(ProxyState {
        config: Arc::new(config),
        registry,
        auth,
        upstream,
    });

    server.run().await.map_err(Into::into)
}

/// Initialize metrics descriptions
fn initialize_metrics() {
    describe_counter!("requests_received", "Total number of requests received");
    describe_counter!(
        "requests_proxied",
        "Total number of requests forwarded upstream"
    );
    describe_counter!(
        "requests_refused",
        "Total number of requests refused during inspection"
    );
    describe_counter!(
        "requests_unauthenticated",
        "Total number of requests with failed authentication"
    );
    describe_counter!(
        "requests_unrecognized",
        "Total number of requests without a matching handler"
    );
    describe_counter!(
        "requests_answered_locally",
        "Total number of requests answered without consulting the cluster"
    );
    describe_counter!("upstream_errors", "Total number of upstream transport errors");
    describe_counter!("upstream_timeouts", "Total number of upstream timeouts");
    describe_counter!("tls_handshake_errors", "Total number of TLS handshake errors");
}
