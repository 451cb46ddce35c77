//! Unit tests for the cluster registry, status patching and backoff

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::metrics::OperatorMetrics;
    use crate::reconciler::status::StatusWriter;
    use crate::reconciler::{BackendFactory, ClusterKey, Reconciler, CLUSTER_FINALIZER};
    use crate::test_utils::*;
    use async_trait::async_trait;
    use axum::http::{Request, Response};
    use crds::{ClusterPhase, PostgresCluster, PostgresClusterStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::client::Body;
    use kube::Client;
    use kube_runtime::controller::Action;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const CLUSTER_PATH: &str =
        "/apis/pgops.microscaler.io/v1alpha1/namespaces/default/postgresclusters/acid-test";

    /// Requests seen by the fake API server, as (method, path)
    type ApiRequests = Arc<Mutex<Vec<(String, String)>>>;

    /// Client whose API server answers every request with the cluster object.
    fn fake_api_client() -> (Client, ApiRequests) {
        let requests = ApiRequests::default();
        let recorded = requests.clone();
        let object = serde_json::to_vec(&finalized(resource(None))).unwrap();
        let service = tower::service_fn(move |request: Request<Body>| {
            recorded
                .lock()
                .unwrap()
                .push((request.method().to_string(), request.uri().path().to_string()));
            let object = object.clone();
            async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(Body::from(object))
                        .unwrap(),
                )
            }
        });
        (Client::new(service, TEST_NAMESPACE), requests)
    }

    fn finalized(mut resource: PostgresCluster) -> PostgresCluster {
        resource.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
        resource
    }

    #[derive(Default)]
    struct RecordingStatusWriter {
        patches: Mutex<Vec<(String, String, serde_json::Value)>>,
    }

    impl RecordingStatusWriter {
        fn patches(&self) -> Vec<(String, String, serde_json::Value)> {
            self.patches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusWriter for RecordingStatusWriter {
        async fn patch_status(
            &self,
            namespace: &str,
            name: &str,
            patch: serde_json::Value,
        ) -> Result<(), ControllerError> {
            self.patches
                .lock()
                .unwrap()
                .push((namespace.to_string(), name.to_string(), patch));
            Ok(())
        }
    }

    fn key() -> ClusterKey {
        (TEST_NAMESPACE.to_string(), TEST_CLUSTER.to_string())
    }

    fn resource(status: Option<ClusterPhase>) -> PostgresCluster {
        let mut resource = PostgresCluster::new(TEST_CLUSTER, test_spec(3, "10Gi"));
        resource.metadata.namespace = Some(TEST_NAMESPACE.to_string());
        resource.status = status.map(|phase| PostgresClusterStatus {
            phase,
            ..Default::default()
        });
        resource
    }

    fn reconciler(
        backends: &TestBackends,
        writer: Arc<RecordingStatusWriter>,
    ) -> (Reconciler, Arc<OperatorMetrics>) {
        let (reconciler, metrics, _) = reconciler_with_api(backends, writer);
        (reconciler, metrics)
    }

    fn reconciler_with_api(
        backends: &TestBackends,
        writer: Arc<RecordingStatusWriter>,
    ) -> (Reconciler, Arc<OperatorMetrics>, ApiRequests) {
        let cluster_backends = backends.backends();
        let factory: BackendFactory = Arc::new(move |_| cluster_backends.clone());
        let metrics = Arc::new(OperatorMetrics::new().unwrap());
        let (client, requests) = fake_api_client();
        let reconciler = Reconciler::new(
            client,
            Arc::new(test_config()),
            metrics.clone(),
            factory,
            writer,
        );
        (reconciler, metrics, requests)
    }

    #[tokio::test]
    async fn test_successful_sync_patches_status_once() {
        let backends = TestBackends::new();
        backends.simulate_statefulset_controller();
        let writer = Arc::new(RecordingStatusWriter::default());
        let (reconciler, metrics) = reconciler(&backends, writer.clone());

        let action = reconciler.reconcile(&resource(None)).await.unwrap();

        assert_eq!(action, Action::requeue(test_config().resync_period));
        let patches = writer.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].1, TEST_CLUSTER);
        assert_eq!(patches[0].2["status"]["phase"], "Running");
        assert_eq!(metrics.managed_clusters.get(), 1);

        // The persisted phase is already Running: no second patch
        reconciler
            .reconcile(&resource(Some(ClusterPhase::Running)))
            .await
            .unwrap();
        assert_eq!(writer.patches().len(), 1);
        assert_eq!(metrics.syncs_total.with_label_values(&["success"]).get(), 2);
    }

    #[tokio::test]
    async fn test_failed_sync_reports_error_and_backs_off() {
        let backends = TestBackends::new();
        backends
            .secrets
            .fail_on(StoreOp::Create, "postgres.acid-test.credentials");
        let writer = Arc::new(RecordingStatusWriter::default());
        let (reconciler, metrics) = reconciler(&backends, writer.clone());

        let err = reconciler.reconcile(&resource(None)).await.unwrap_err();

        assert_eq!(err.stage(), Some("secrets"));
        let patches = writer.patches();
        assert_eq!(patches[0].2["status"]["phase"], "SyncFailed");
        assert!(patches[0].2["status"]["error"]
            .as_str()
            .unwrap()
            .contains("could not sync secrets"));
        assert_eq!(
            metrics
                .sync_stage_failures_total
                .with_label_values(&["secrets"])
                .get(),
            1
        );

        assert_eq!(reconciler.backoff_for(&key()), (Duration::from_secs(10), 1));
        assert_eq!(reconciler.backoff_for(&key()), (Duration::from_secs(10), 1));
        assert_eq!(reconciler.backoff_for(&key()).0, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_recovery_resets_the_backoff() {
        let backends = TestBackends::new();
        backends.simulate_statefulset_controller();
        backends
            .secrets
            .fail_on(StoreOp::Create, "postgres.acid-test.credentials");
        let writer = Arc::new(RecordingStatusWriter::default());
        let (reconciler, _) = reconciler(&backends, writer.clone());

        assert!(reconciler.reconcile(&resource(None)).await.is_err());
        reconciler.backoff_for(&key());
        reconciler.backoff_for(&key());
        reconciler.backoff_for(&key());

        backends.secrets.clear_failures();
        reconciler
            .reconcile(&resource(Some(ClusterPhase::SyncFailed)))
            .await
            .unwrap();

        assert_eq!(reconciler.backoff_for(&key()), (Duration::from_secs(10), 0));
        let patches = writer.patches();
        assert_eq!(patches.last().unwrap().2["status"]["phase"], "Running");
        assert_eq!(patches.last().unwrap().2["status"]["error"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_new_cluster_only_gets_the_finalizer() {
        let backends = TestBackends::new();
        let writer = Arc::new(RecordingStatusWriter::default());
        let (reconciler, _, requests) = reconciler_with_api(&backends, writer.clone());

        let action = reconciler
            .reconcile_with_finalizer(Arc::new(resource(None)))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(
            *requests.lock().unwrap(),
            vec![("PATCH".to_string(), CLUSTER_PATH.to_string())]
        );
        assert!(backends.journal().is_empty());
        assert!(writer.patches().is_empty());
        assert!(!reconciler.is_registered(&key()).await);
    }

    #[tokio::test]
    async fn test_finalized_cluster_is_synced() {
        let backends = TestBackends::new();
        backends.simulate_statefulset_controller();
        let writer = Arc::new(RecordingStatusWriter::default());
        let (reconciler, _, requests) = reconciler_with_api(&backends, writer.clone());

        let action = reconciler
            .reconcile_with_finalizer(Arc::new(finalized(resource(None))))
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(test_config().resync_period));
        assert!(requests.lock().unwrap().is_empty());
        assert!(reconciler.is_registered(&key()).await);
        assert_eq!(writer.patches()[0].2["status"]["phase"], "Running");
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_evicted() {
        let backends = TestBackends::new();
        backends.simulate_statefulset_controller();
        let writer = Arc::new(RecordingStatusWriter::default());
        let (reconciler, metrics, requests) = reconciler_with_api(&backends, writer);
        reconciler
            .reconcile_with_finalizer(Arc::new(finalized(resource(None))))
            .await
            .unwrap();
        assert!(reconciler.is_registered(&key()).await);

        let mut deleted = finalized(resource(Some(ClusterPhase::Running)));
        deleted.metadata = serde_json::from_value::<ObjectMeta>(serde_json::json!({
            "name": TEST_CLUSTER,
            "namespace": TEST_NAMESPACE,
            "deletionTimestamp": "2024-05-01T12:00:00Z",
            "finalizers": [CLUSTER_FINALIZER],
        }))
        .unwrap();
        backends.clear_journal();

        let action = reconciler
            .reconcile_with_finalizer(Arc::new(deleted))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(!reconciler.is_registered(&key()).await);
        assert_eq!(metrics.managed_clusters.get(), 0);
        assert!(backends.journal().is_empty());
        // The finalizer is removed only after the eviction
        assert_eq!(
            *requests.lock().unwrap(),
            vec![("PATCH".to_string(), CLUSTER_PATH.to_string())]
        );
    }
}
