//! Keeps the provider in step with the pods the scheduler binds to a node.
//!
//! Pod events come from a `kube` watcher filtered on `spec.nodeName`. They are
//! sharded over a fixed set of workers by `namespace/name`, so events for one
//! pod are handled in order while different pods proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use log::{debug, error, info, warn};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::provider::{pod_name, pod_namespace, Provider};

const WORKER_QUEUE: usize = 64;
const WATCH_ERROR_DELAY: Duration = Duration::from_secs(5);
const PROVIDER_FAILED: &str = "ProviderFailed";

/// Drives pods bound to one node through its provider.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodReconciler: Send + Sync {
    /// Watch and reconcile pods until `token` is cancelled.
    async fn run(&self, token: CancellationToken, workers: usize) -> Result<()>;

    /// Copy the provider's view of every pod it runs into the pod's status.
    async fn update_pod_statuses(&self);
}

/// Writes to the cluster's Pod objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Pods currently bound to the node
    async fn list(&self) -> Result<Vec<Pod>>;

    /// Delete without grace period, once the provider has released the pod
    async fn force_delete(&self, namespace: &str, name: &str) -> Result<()>;

    async fn patch_status(&self, namespace: &str, name: &str, status: &PodStatus) -> Result<()>;
}

pub struct KubePodClient {
    client: Client,
    node_name: String,
    namespace: String,
}

impl KubePodClient {
    pub fn new(client: Client, node_name: &str, namespace: &str) -> Self {
        Self {
            client,
            node_name: node_name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn watched(&self) -> Api<Pod> {
        if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }

    fn field_selector(&self) -> String {
        format!("spec.nodeName={}", self.node_name)
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn list(&self) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&self.field_selector());
        let list = self
            .watched()
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, &format!("pods of {}", self.node_name)))?;
        Ok(list.items)
    }

    async fn force_delete(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .delete(name, &params)
            .await
            .map_err(|e| Error::from_kube(e, &format!("pod {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &PodStatus) -> Result<()> {
        let patch = json!({ "status": status });
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, &format!("pod {}/{}", namespace, name)))?;
        Ok(())
    }
}

#[derive(Debug)]
enum PodEvent {
    Applied(Pod),
    Deleted(Pod),
}

impl PodEvent {
    fn pod(&self) -> &Pod {
        match self {
            PodEvent::Applied(pod) | PodEvent::Deleted(pod) => pod,
        }
    }
}

/// Worker index for a pod; stable for the lifetime of the process.
pub fn shard(namespace: &str, name: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    namespace.hash(&mut hasher);
    name.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

fn key(pod: &Pod) -> (String, String) {
    (pod_namespace(pod).to_string(), pod_name(pod).to_string())
}

/// Provider pods that are no longer bound to the node.
fn orphaned(listed: &[Pod], provider_pods: Vec<Pod>) -> Vec<Pod> {
    let listed: HashSet<_> = listed.iter().map(key).collect();
    provider_pods
        .into_iter()
        .filter(|pod| !listed.contains(&key(pod)))
        .collect()
}

/// Event handling shared by all workers.
#[derive(Clone)]
pub struct PodHandler {
    provider: Arc<dyn Provider>,
    pods: Arc<dyn PodClient>,
}

impl PodHandler {
    pub fn new(provider: Arc<dyn Provider>, pods: Arc<dyn PodClient>) -> Self {
        Self { provider, pods }
    }

    async fn handle(&self, event: PodEvent) {
        match event {
            PodEvent::Applied(pod) if pod.metadata.deletion_timestamp.is_some() => {
                self.terminate(&pod).await
            }
            PodEvent::Applied(pod) => self.apply(&pod).await,
            PodEvent::Deleted(pod) => {
                if let Err(e) = self.release(&pod).await {
                    error!("Error deleting pod {}/{}: {}", pod_namespace(&pod), pod_name(&pod), e);
                }
            }
        }
    }

    async fn release(&self, pod: &Pod) -> Result<()> {
        match self.provider.delete_pod(pod).await {
            Err(e) if e.is_not_found() => {
                debug!("pod {} was not known to the provider", pod_name(pod));
                Ok(())
            }
            other => other,
        }
    }

    async fn terminate(&self, pod: &Pod) {
        let (namespace, name) = key(pod);
        if let Err(e) = self.release(pod).await {
            error!("Error deleting pod {}/{}: {}", namespace, name, e);
            return;
        }
        match self.pods.force_delete(&namespace, &name).await {
            Ok(()) => info!("pod {}/{} deleted", namespace, name),
            Err(e) if e.is_not_found() => {}
            Err(e) => error!("Error force deleting pod {}/{}: {}", namespace, name, e),
        }
    }

    async fn apply(&self, pod: &Pod) {
        let (namespace, name) = key(pod);
        let known = match self.provider.get_pod(&namespace, &name).await {
            Ok(known) => known,
            Err(e) => {
                error!("Error looking up pod {}/{}: {}", namespace, name, e);
                return;
            }
        };

        match known {
            None => match self.provider.create_pod(pod).await {
                Ok(()) => info!("pod {}/{} created", namespace, name),
                Err(Error::InvalidArgument(message)) => self.mark_failed(&namespace, &name, message).await,
                Err(e) => error!("Error creating pod {}/{}: {}", namespace, name, e),
            },
            Some(known) if known.spec != pod.spec || known.metadata.annotations != pod.metadata.annotations => {
                match self.provider.update_pod(pod).await {
                    Ok(()) => info!("pod {}/{} updated", namespace, name),
                    Err(e) => error!("Error updating pod {}/{}: {}", namespace, name, e),
                }
            }
            Some(_) => debug!("pod {}/{} unchanged", namespace, name),
        }
    }

    async fn mark_failed(&self, namespace: &str, name: &str, message: String) {
        warn!("pod {}/{} rejected by provider: {}", namespace, name, message);
        let status = PodStatus {
            phase: Some("Failed".to_string()),
            reason: Some(PROVIDER_FAILED.to_string()),
            message: Some(message),
            ..Default::default()
        };
        if let Err(e) = self.pods.patch_status(namespace, name, &status).await {
            error!("Error marking pod {}/{} failed: {}", namespace, name, e);
        }
    }

    pub async fn update_pod_statuses(&self) {
        let pods = match self.provider.get_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Error listing provider pods: {}", e);
                return;
            }
        };
        for pod in pods {
            let (namespace, name) = key(&pod);
            let status = match self.provider.get_pod_status(&namespace, &name).await {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Error getting status of pod {}/{}: {}", namespace, name, e);
                    continue;
                }
            };
            match self.pods.patch_status(&namespace, &name, &status).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("pod {}/{} is gone", namespace, name),
                Err(e) => warn!("Error updating status of pod {}/{}: {}", namespace, name, e),
            }
        }
    }
}

/// Watch-driven [`PodReconciler`] for one virtual node.
pub struct PodController {
    pods: Arc<KubePodClient>,
    handler: PodHandler,
    resync_period: Duration,
}

impl PodController {
    pub fn new(
        client: Client,
        node_name: &str,
        namespace: &str,
        provider: Arc<dyn Provider>,
        resync_period: Duration,
    ) -> Self {
        let pods = Arc::new(KubePodClient::new(client, node_name, namespace));
        let handler = PodHandler::new(provider, pods.clone());
        Self {
            pods,
            handler,
            resync_period,
        }
    }

    async fn resync(&self, senders: &[mpsc::Sender<PodEvent>], listed: Vec<Pod>) {
        let orphans = match self.handler.provider.get_pods().await {
            Ok(provider_pods) => orphaned(&listed, provider_pods),
            Err(e) => {
                warn!("Error listing provider pods: {}", e);
                Vec::new()
            }
        };
        for pod in listed {
            dispatch(senders, PodEvent::Applied(pod)).await;
        }
        for pod in orphans {
            dispatch(senders, PodEvent::Deleted(pod)).await;
        }
    }
}

async fn dispatch(senders: &[mpsc::Sender<PodEvent>], event: PodEvent) {
    let (namespace, name) = key(event.pod());
    let index = shard(&namespace, &name, senders.len());
    if senders[index].send(event).await.is_err() {
        debug!("worker {} has stopped, dropping event for {}/{}", index, namespace, name);
    }
}

#[async_trait]
impl PodReconciler for PodController {
    async fn run(&self, token: CancellationToken, workers: usize) -> Result<()> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel(WORKER_QUEUE);
            let handler = self.handler.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => handler.handle(event).await,
                            None => break,
                        },
                    }
                }
            }));
            senders.push(tx);
        }

        let config = watcher::Config::default().fields(&self.pods.field_selector());
        let mut events = std::pin::pin!(watcher::watcher(self.pods.watched(), config));

        let mut resync = tokio::time::interval(self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The watcher starts with a full listing, skip the immediate tick.
        resync.tick().await;

        info!("watching pods with {}", self.pods.field_selector());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(Event::Applied(pod))) => dispatch(&senders, PodEvent::Applied(pod)).await,
                    Some(Ok(Event::Deleted(pod))) => dispatch(&senders, PodEvent::Deleted(pod)).await,
                    Some(Ok(Event::Restarted(pods))) => self.resync(&senders, pods).await,
                    Some(Err(e)) => {
                        warn!("Pod watch error, will retry: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(WATCH_ERROR_DELAY) => {}
                        }
                    }
                    None => break,
                },
                _ = resync.tick() => match self.pods.list().await {
                    Ok(pods) => self.resync(&senders, pods).await,
                    Err(e) => warn!("Error listing pods for resync: {}", e),
                },
            }
        }

        drop(senders);
        for task in tasks {
            if let Err(e) = task.await {
                error!("pod worker failed: {}", e);
            }
        }
        debug!("pod reconciler stopped");
        Ok(())
    }

    async fn update_pod_statuses(&self) {
        self.handler.update_pod_statuses().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::test_support::pod;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn handler(provider: MockProvider, pods: MockPodClient) -> PodHandler {
        PodHandler::new(Arc::new(provider), Arc::new(pods))
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        for workers in 1..8 {
            let first = shard("default", "app1", workers);
            assert!(first < workers);
            assert_eq!(first, shard("default", "app1", workers));
        }
        assert_eq!(shard("default", "app1", 0), 0);
    }

    #[test]
    fn orphaned_keeps_only_unlisted_pods() {
        let listed = vec![pod("app1", &[])];
        let orphans = orphaned(&listed, vec![pod("app1", &[]), pod("app2", &[])]);
        assert_eq!(orphans.len(), 1);
        assert_eq!(pod_name(&orphans[0]), "app2");
    }

    #[tokio::test]
    async fn new_pod_is_created() {
        let mut provider = MockProvider::new();
        provider.expect_get_pod().returning(|_, _| Ok(None));
        provider.expect_create_pod().times(1).returning(|_| Ok(()));
        let handler = handler(provider, MockPodClient::new());
        handler.handle(PodEvent::Applied(pod("app1", &[]))).await;
    }

    #[tokio::test]
    async fn changed_annotations_trigger_an_update() {
        let mut provider = MockProvider::new();
        provider
            .expect_get_pod()
            .returning(|_, name| Ok(Some(pod(name, &[("microservices", "[]")]))));
        provider.expect_update_pod().times(1).returning(|_| Ok(()));
        let handler = handler(provider, MockPodClient::new());
        handler
            .handle(PodEvent::Applied(pod("app1", &[("microservices", "[{\"name\":\"a\"}]")])))
            .await;
    }

    #[tokio::test]
    async fn unchanged_pod_is_left_alone() {
        let mut provider = MockProvider::new();
        provider
            .expect_get_pod()
            .returning(|_, name| Ok(Some(pod(name, &[]))));
        let handler = handler(provider, MockPodClient::new());
        handler.handle(PodEvent::Applied(pod("app1", &[]))).await;
    }

    #[tokio::test]
    async fn rejected_pod_is_marked_failed() {
        let mut provider = MockProvider::new();
        provider.expect_get_pod().returning(|_, _| Ok(None));
        provider
            .expect_create_pod()
            .returning(|_| Err(Error::invalid_argument("no microservices annotation")));
        let mut pods = MockPodClient::new();
        pods.expect_patch_status()
            .withf(|namespace, name, status| {
                namespace == "default"
                    && name == "app1"
                    && status.phase.as_deref() == Some("Failed")
                    && status.reason.as_deref() == Some("ProviderFailed")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        handler(provider, pods)
            .handle(PodEvent::Applied(pod("app1", &[])))
            .await;
    }

    #[tokio::test]
    async fn terminating_pod_is_released_then_force_deleted() {
        let mut provider = MockProvider::new();
        provider
            .expect_delete_pod()
            .times(1)
            .returning(|_| Err(Error::not_found("app1")));
        let mut pods = MockPodClient::new();
        pods.expect_force_delete()
            .withf(|namespace, name| namespace == "default" && name == "app1")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut terminating = pod("app1", &[]);
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        handler(provider, pods)
            .handle(PodEvent::Applied(terminating))
            .await;
    }

    #[tokio::test]
    async fn failed_release_keeps_the_pod() {
        let mut provider = MockProvider::new();
        provider
            .expect_delete_pod()
            .returning(|_| Err(Error::unavailable("connection refused")));
        let mut terminating = pod("app1", &[]);
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        handler(provider, MockPodClient::new())
            .handle(PodEvent::Applied(terminating))
            .await;
    }

    #[tokio::test]
    async fn statuses_are_copied_and_missing_pods_ignored() {
        let mut provider = MockProvider::new();
        provider
            .expect_get_pods()
            .returning(|| Ok(vec![pod("app1", &[]), pod("gone", &[]), pod("fresh", &[])]));
        provider.expect_get_pod_status().returning(|_, name| {
            if name == "fresh" {
                Ok(None)
            } else {
                Ok(Some(PodStatus {
                    phase: Some("Running".to_string()),
                    ..Default::default()
                }))
            }
        });
        let mut pods = MockPodClient::new();
        pods.expect_patch_status()
            .withf(|_, name, _| name == "app1")
            .times(1)
            .returning(|_, _, _| Ok(()));
        pods.expect_patch_status()
            .withf(|_, name, _| name == "gone")
            .times(1)
            .returning(|_, name, _| Err(Error::not_found(name.to_string())));

        handler(provider, pods).update_pod_statuses().await;
    }
}
