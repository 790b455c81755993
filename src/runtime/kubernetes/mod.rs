//! Kubernetes flavor of the agent runtime: sessions run as single-replica
//! Deployments with a ClusterIP service in front of the framebuffer port.

pub mod workload;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use uuid::Uuid;

use crate::protocol::{
    SessionRefPayload, StartSessionPayload, StopSessionPayload, WorkloadMetadata,
};
use crate::runtime::framebuffer::FramebufferTarget;
use crate::runtime::handler::{CommandHandler, HandlerRegistry};
use crate::types::CommandAction;

use workload::{
    FRAMEBUFFER_PORT, build_deployment, build_home_pvc, build_service, home_pvc_name,
    service_name, session_label_selector, workload_name,
};

const READY_POLL: Duration = Duration::from_secs(2);
const READY_TIMEOUT: Duration = Duration::from_secs(240);

pub struct KubernetesRuntime {
    client: Client,
    namespace: String,
    /// Non-terminal workloads this agent hosts, reported in heartbeats.
    active_sessions: Arc<AtomicI64>,
}

impl KubernetesRuntime {
    pub fn new(client: Client, namespace: String, active_sessions: Arc<AtomicI64>) -> Arc<Self> {
        Arc::new(Self {
            client,
            namespace,
            active_sessions,
        })
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Count the session workloads already present in the cluster. Run at
    /// startup so heartbeats are honest after an agent restart.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let sessions = self.list_sessions().await?;
        self.active_sessions
            .store(sessions.len() as i64, Ordering::SeqCst);
        tracing::info!(count = sessions.len(), "reconciled existing session workloads");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session operations
    // -----------------------------------------------------------------------

    pub async fn start_session(
        &self,
        payload: StartSessionPayload,
    ) -> anyhow::Result<WorkloadMetadata> {
        let session_id = payload.session_id;
        let name = workload_name(session_id);

        if payload.persistent_home {
            let pvc = build_home_pvc(&payload, &self.namespace);
            match self.pvcs().create(&PostParams::default(), &pvc).await {
                Ok(_) => {
                    tracing::info!(user = %payload.user, pvc = home_pvc_name(&payload.user), "home volume created");
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {} // shared across sessions
                Err(e) => return Err(e).context("creating home volume"),
            }
        }

        let deployment = build_deployment(&payload, &self.namespace);
        let created = match self
            .deployments()
            .create(&PostParams::default(), &deployment)
            .await
        {
            Ok(_) => true,
            // Already running: report the existing workload instead of
            // failing, so start_session is safe to re-run.
            Err(kube::Error::Api(e)) if e.code == 409 => false,
            Err(e) => return Err(e).context("creating workload"),
        };

        let service = build_service(&payload, &self.namespace);
        match self.services().create(&PostParams::default(), &service).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => {
                if created {
                    self.cleanup_workload(session_id).await;
                }
                return Err(e).context("creating service");
            }
        }

        let pod_ip = match self.wait_ready(session_id, READY_TIMEOUT).await {
            Ok(pod_ip) => pod_ip,
            Err(e) => {
                if created {
                    self.cleanup_workload(session_id).await;
                }
                return Err(e);
            }
        };

        if created {
            self.active_sessions.fetch_add(1, Ordering::SeqCst);
        }
        tracing::info!(%session_id, workload = name, %pod_ip, "session workload ready");

        Ok(WorkloadMetadata {
            workload_name: name,
            pod_ip,
            service_name: service_name(session_id),
            framebuffer_port: FRAMEBUFFER_PORT,
        })
    }

    pub async fn stop_session(&self, payload: StopSessionPayload) -> anyhow::Result<()> {
        let session_id = payload.session_id;

        // The owning user is only recoverable from the workload labels, so
        // resolve it before the deployment goes away.
        let home_owner = if payload.delete_persistent {
            self.workload_user_label(session_id).await
        } else {
            None
        };

        let deleted = delete_ignoring_missing(&self.deployments(), &workload_name(session_id))
            .await
            .context("deleting workload")?;
        delete_ignoring_missing(&self.services(), &service_name(session_id))
            .await
            .context("deleting service")?;

        // The home volume is user-scoped and shared across the user's
        // sessions; it survives unless the caller explicitly opted in.
        if let Some(user) = home_owner {
            tracing::warn!(%session_id, user, "deleting persistent home volume on request");
            delete_ignoring_missing(&self.pvcs(), &home_pvc_name(&user))
                .await
                .context("deleting home volume")?;
        }

        if deleted {
            self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::info!(%session_id, "session workload stopped");
        Ok(())
    }

    async fn workload_user_label(&self, session_id: Uuid) -> Option<String> {
        let deployment = self.deployments().get(&workload_name(session_id)).await.ok()?;
        deployment
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("holodeck.io/user").cloned())
    }

    pub async fn hibernate_session(&self, session_id: Uuid) -> anyhow::Result<()> {
        self.scale(session_id, 0).await?;
        tracing::info!(%session_id, "session workload scaled to zero");
        Ok(())
    }

    pub async fn wake_session(&self, session_id: Uuid) -> anyhow::Result<serde_json::Value> {
        self.scale(session_id, 1).await?;
        let pod_ip = self.wait_ready(session_id, READY_TIMEOUT).await?;
        tracing::info!(%session_id, %pod_ip, "session workload woken");
        Ok(serde_json::json!({ "pod_ip": pod_ip }))
    }

    pub async fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
        let list = self
            .deployments()
            .list(&ListParams::default().labels("holodeck.io/app=session"))
            .await
            .context("listing session workloads")?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|d| {
                d.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("holodeck.io/session").cloned())
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn scale(&self, session_id: Uuid, replicas: i32) -> anyhow::Result<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(
                &workload_name(session_id),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .with_context(|| format!("scaling workload to {replicas}"))?;
        Ok(())
    }

    /// Poll until the session's pod is running and ready, returning its IP.
    async fn wait_ready(&self, session_id: Uuid, timeout: Duration) -> anyhow::Result<String> {
        let selector = session_label_selector(session_id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let pods = self
                .pods()
                .list(&ListParams::default().labels(&selector))
                .await
                .context("listing session pods")?;

            if let Some(pod_ip) = pods.items.iter().find_map(ready_pod_ip) {
                return Ok(pod_ip);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("workload for session {session_id} not ready in time"));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Best-effort teardown of a partially created session.
    async fn cleanup_workload(&self, session_id: Uuid) {
        let _ = delete_ignoring_missing(&self.deployments(), &workload_name(session_id)).await;
        let _ = delete_ignoring_missing(&self.services(), &service_name(session_id)).await;
    }
}

fn ready_pod_ip(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Running") {
        return None;
    }
    let all_ready = status
        .container_statuses
        .as_ref()
        .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready));
    if !all_ready {
        return None;
    }
    status.pod_ip.clone()
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> anyhow::Result<bool>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Handler and framebuffer wiring
// ---------------------------------------------------------------------------

struct KubernetesHandler {
    runtime: Arc<KubernetesRuntime>,
    action: CommandAction,
}

#[async_trait]
impl CommandHandler for KubernetesHandler {
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        match self.action {
            CommandAction::StartSession => {
                let payload: StartSessionPayload = serde_json::from_value(payload)?;
                let metadata = self.runtime.start_session(payload).await?;
                Ok(serde_json::to_value(metadata)?)
            }
            CommandAction::StopSession => {
                let payload: StopSessionPayload = serde_json::from_value(payload)?;
                self.runtime.stop_session(payload).await?;
                Ok(serde_json::json!({ "stopped": true }))
            }
            CommandAction::HibernateSession => {
                let payload: SessionRefPayload = serde_json::from_value(payload)?;
                self.runtime.hibernate_session(payload.session_id).await?;
                Ok(serde_json::json!({ "hibernated": true }))
            }
            CommandAction::WakeSession => {
                let payload: SessionRefPayload = serde_json::from_value(payload)?;
                self.runtime.wake_session(payload.session_id).await
            }
            CommandAction::ListSessions => {
                let sessions = self.runtime.list_sessions().await?;
                Ok(serde_json::json!({ "sessions": sessions }))
            }
            _ => Err(anyhow!("unhandled action {}", self.action.as_str())),
        }
    }
}

pub fn register_handlers(registry: &mut HandlerRegistry, runtime: Arc<KubernetesRuntime>) {
    for action in [
        CommandAction::StartSession,
        CommandAction::StopSession,
        CommandAction::HibernateSession,
        CommandAction::WakeSession,
        CommandAction::ListSessions,
    ] {
        registry.register(
            action,
            Arc::new(KubernetesHandler {
                runtime: runtime.clone(),
                action,
            }),
        );
    }
}

#[async_trait]
impl FramebufferTarget for KubernetesRuntime {
    /// The port-forward target is the session's cluster-internal service.
    async fn framebuffer_endpoint(&self, session_id: Uuid) -> anyhow::Result<(String, u16)> {
        let host = format!("{}.{}.svc", service_name(session_id), self.namespace);
        Ok((host, FRAMEBUFFER_PORT))
    }
}
