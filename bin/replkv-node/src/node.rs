//! Node assembly
//!
//! Opens storage, joins the cluster and wires the service, router and
//! background loops together.

use crate::api::{self, AppState};
use crate::metrics::NodeMetrics;
use crate::service::KvService;
use crate::supervisor::{FailureReporter, Supervisor};
use axum::Router;
use replkv_cluster::{Membership, Replicator};
use replkv_common::{Config, Error, Result};
use replkv_storage::StorageEngine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct Node {
    config: Config,
    engine: Arc<StorageEngine>,
    membership: Arc<Membership>,
    service: Arc<KvService>,
    metrics: Arc<NodeMetrics>,
}

impl Node {
    /// Open storage and discover peers
    pub async fn build(config: Config, failures: FailureReporter) -> Result<Self> {
        let storage = config.storage.clone();
        let engine = tokio::task::spawn_blocking(move || StorageEngine::open(&storage))
            .await
            .map_err(|e| Error::internal(format!("storage open task failed: {e}")))??;
        let engine = Arc::new(engine);

        let self_addr = config.node.self_address();
        match &self_addr {
            Some(addr) => info!("Advertising {}", addr),
            None => warn!("No CNAME or advertise address set; updates sent to peers carry no origin"),
        }

        let membership = if config.cluster.cluster_file.exists()
            || !config.cluster.allow_missing_cluster_file
        {
            Membership::init(&config.cluster, self_addr).await?
        } else {
            warn!(
                "Cluster file {} not found, running without peers",
                config.cluster.cluster_file.display()
            );
            Membership::from_peers(self_addr, Vec::new(), config.cluster.peer_timeout())?
        };
        let membership = Arc::new(membership);
        info!(
            "{} of {} configured peers are live",
            membership.live_count(),
            membership.configured().len()
        );

        let replicator = Arc::new(Replicator::new(
            Arc::clone(&engine),
            Arc::clone(&membership),
            config.cluster.peer_timeout(),
        )?);
        let service = Arc::new(KvService::new(Arc::clone(&engine), replicator, failures));

        Ok(Self {
            config,
            engine,
            membership,
            service,
            metrics: Arc::new(NodeMetrics::new()),
        })
    }

    pub fn router(&self) -> Router {
        api::router(AppState {
            service: Arc::clone(&self.service),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Start the compaction and health check loops under `supervisor`
    pub fn spawn_background(&self, supervisor: &mut Supervisor) {
        let shutdown = supervisor.shutdown_token();

        supervisor.spawn(
            "compactor",
            self.engine.compactor().run(
                self.config.storage.compaction_interval(),
                self.config.storage.max_compaction_failures,
                shutdown.clone(),
            ),
        );
        supervisor.spawn(
            "health check",
            Arc::clone(&self.membership).run(
                self.config.cluster.ping_interval(),
                self.config.cluster.exit_on_isolation,
                shutdown,
            ),
        );
    }

    /// Serve the API on `listener` under `supervisor`
    pub fn spawn_server(&self, supervisor: &mut Supervisor, listener: TcpListener) {
        let shutdown = supervisor.shutdown_token();
        let app = self.router();
        supervisor.spawn("http server", async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .map_err(Error::Io)
        });
    }

    pub fn service(&self) -> &Arc<KvService> {
        &self.service
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close storage after the supervised tasks have stopped
    pub fn close(self) {
        let Self {
            engine,
            membership,
            service,
            metrics,
            ..
        } = self;
        drop((service, membership, metrics));
        match Arc::try_unwrap(engine) {
            Ok(engine) => engine.close(),
            Err(_) => warn!("Storage engine still referenced at shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use replkv_common::config::StorageConfig;
    use std::path::Path;
    use tower::ServiceExt;

    fn test_config(data_dir: &Path, cluster_file: &Path, advertise: Option<String>) -> Config {
        let mut config = Config::default();
        config.storage = StorageConfig {
            sync_on_write: false,
            ..StorageConfig::with_data_dir(data_dir)
        };
        config.cluster.cluster_file = cluster_file.to_path_buf();
        config.cluster.peer_timeout_ms = 1000;
        config.cluster.allow_missing_cluster_file = true;
        config.node.advertise_addr = advertise;
        config
    }

    async fn get_message(app: &Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        (status, body["message"].as_str().unwrap_or_default().to_string())
    }

    /// Start a node serving on an ephemeral port, returning it and its URL
    async fn serve_node(config: Config) -> (Node, Supervisor, String) {
        let mut supervisor = Supervisor::new();
        let node = Node::build(config, supervisor.reporter()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        node.spawn_server(&mut supervisor, listener);
        (node, supervisor, url)
    }

    #[tokio::test]
    async fn test_set_get_delete_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &dir.path().join("cluster.txt"), None);

        {
            let node = Node::build(config.clone(), FailureReporter::detached())
                .await
                .unwrap();
            let app = node.router();

            assert_eq!(
                get_message(&app, "/set?key=a&value=1").await,
                (StatusCode::OK, "Key saved".to_string())
            );
            assert_eq!(
                get_message(&app, "/set?key=b&value=2").await.0,
                StatusCode::OK
            );
            assert_eq!(
                get_message(&app, "/delete?key=a").await,
                (StatusCode::OK, "Key deleted".to_string())
            );
            drop(app);
            node.close();
        }

        // Nothing was compacted; recovery replays the log
        let node = Node::build(config, FailureReporter::detached())
            .await
            .unwrap();
        let app = node.router();
        assert_eq!(get_message(&app, "/get?key=a").await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            get_message(&app, "/get?key=b").await,
            (StatusCode::OK, "2".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_cluster_file_is_fatal_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), &dir.path().join("absent.txt"), None);
        config.cluster.allow_missing_cluster_file = false;

        let err = Node::build(config.clone(), FailureReporter::detached())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));

        config.cluster.allow_missing_cluster_file = true;
        let node = Node::build(config, FailureReporter::detached())
            .await
            .unwrap();
        assert!(node.membership.peers().is_empty());
    }

    #[tokio::test]
    async fn test_two_node_propagation() {
        let dir_b = tempfile::tempdir().unwrap();
        let config_b = test_config(dir_b.path(), &dir_b.path().join("cluster.txt"), None);
        let (node_b, supervisor_b, url_b) = serve_node(config_b).await;

        let dir_a = tempfile::tempdir().unwrap();
        let cluster_file = dir_a.path().join("cluster.txt");
        std::fs::write(&cluster_file, format!("http://node-a:8080\n{url_b}\n")).unwrap();
        let config_a = test_config(
            dir_a.path(),
            &cluster_file,
            Some("http://node-a:8080".to_string()),
        );
        let node_a = Node::build(config_a, FailureReporter::detached())
            .await
            .unwrap();
        assert_eq!(node_a.membership.peers(), vec![url_b.clone()]);

        let written = node_a.service().write("x", "1").unwrap();
        let report = written.propagation.wait().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(node_b.service().read("x").as_deref(), Some("1"));

        let response = reqwest::get(format!("{url_b}/get?key=x")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["message"], "1");

        // B never forwards what it received
        assert_eq!(node_b.service().replicator().stats().received, 1);
        assert_eq!(node_b.service().replicator().stats().sent, 0);

        supervisor_b.shutdown_token().cancel();
        supervisor_b.wait(std::future::pending()).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_succeeds_when_peer_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let (node, supervisor, url) = serve_node(test_config(
            dir.path(),
            &dir.path().join("cluster.txt"),
            None,
        ))
        .await;

        // Peer list fixed at a dead address; the write must still be acknowledged
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            format!("http://{}", listener.local_addr().unwrap())
        };
        let membership =
            Arc::new(Membership::from_peers(None, vec![dead], node.config().cluster.peer_timeout()).unwrap());
        let replicator = Arc::new(
            Replicator::new(
                Arc::clone(&node.engine),
                membership,
                node.config().cluster.peer_timeout(),
            )
            .unwrap(),
        );
        let service = KvService::new(Arc::clone(&node.engine), replicator, supervisor.reporter());

        let written = service.write("k", "v").unwrap();
        assert_eq!(written.propagation.wait().await.failed, 1);

        let response = reqwest::get(format!("{url}/get?key=k")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        supervisor.shutdown_token().cancel();
        supervisor.wait(std::future::pending()).await.unwrap();
    }
}
