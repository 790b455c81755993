//! Kubernetes object builders for session workloads. Resource names are
//! deterministic from the session id so an agent restart can reconcile
//! against the cluster without consulting the control plane.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use uuid::Uuid;

use crate::protocol::StartSessionPayload;

pub const FRAMEBUFFER_PORT: u16 = 5900;
pub const HOME_MOUNT_PATH: &str = "/home/user";
const DEFAULT_HOME_STORAGE: &str = "10Gi";

pub fn workload_name(session_id: Uuid) -> String {
    format!("hd-{}", &session_id.simple().to_string()[..12])
}

pub fn service_name(session_id: Uuid) -> String {
    format!("{}-fb", workload_name(session_id))
}

/// User-scoped home volume, shared by every session of the user.
pub fn home_pvc_name(user: &str) -> String {
    format!("hd-home-{}", sanitize_label(user))
}

/// Make an arbitrary principal usable as a K8s name/label segment.
pub fn sanitize_label(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(40);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "anon".into()
    } else {
        trimmed.to_owned()
    }
}

pub fn session_labels(payload: &StartSessionPayload) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("holodeck.io/app".into(), "session".into()),
        ("holodeck.io/session".into(), payload.session_id.to_string()),
        ("holodeck.io/user".into(), sanitize_label(&payload.user)),
        (
            "holodeck.io/template".into(),
            sanitize_label(&payload.template),
        ),
    ])
}

pub fn session_label_selector(session_id: Uuid) -> String {
    format!("holodeck.io/session={session_id}")
}

/// Template references arrive pre-resolved to OCI image references by the
/// template catalog upstream of the core.
pub fn resolve_image(template: &str) -> String {
    template.to_owned()
}

pub fn build_deployment(payload: &StartSessionPayload, namespace: &str) -> Deployment {
    let labels = session_labels(payload);
    let selector = BTreeMap::from([(
        "holodeck.io/session".to_owned(),
        payload.session_id.to_string(),
    )]);

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if payload.persistent_home {
        volumes.push(Volume {
            name: "home".into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: home_pvc_name(&payload.user),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "home".into(),
            mount_path: HOME_MOUNT_PATH.into(),
            ..Default::default()
        });
    }

    let container = Container {
        name: "session".into(),
        image: Some(resolve_image(&payload.template)),
        ports: Some(vec![ContainerPort {
            name: Some("framebuffer".into()),
            container_port: i32::from(FRAMEBUFFER_PORT),
            ..Default::default()
        }]),
        resources: Some(session_resources(payload)),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name(payload.session_id)),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: if volumes.is_empty() { None } else { Some(volumes) },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn session_resources(payload: &StartSessionPayload) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    if !payload.resources.cpu.is_empty() {
        requests.insert("cpu".to_owned(), Quantity(payload.resources.cpu.clone()));
    }
    if !payload.resources.memory.is_empty() {
        requests.insert(
            "memory".to_owned(),
            Quantity(payload.resources.memory.clone()),
        );
    }
    ResourceRequirements {
        limits: Some(requests.clone()),
        requests: Some(requests),
        ..Default::default()
    }
}

pub fn build_service(payload: &StartSessionPayload, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(payload.session_id)),
            namespace: Some(namespace.to_owned()),
            labels: Some(session_labels(payload)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(BTreeMap::from([(
                "holodeck.io/session".to_owned(),
                payload.session_id.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("framebuffer".into()),
                port: i32::from(FRAMEBUFFER_PORT),
                target_port: Some(IntOrString::Int(i32::from(FRAMEBUFFER_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_home_pvc(payload: &StartSessionPayload, namespace: &str) -> PersistentVolumeClaim {
    let storage = payload
        .resources
        .storage
        .clone()
        .unwrap_or_else(|| DEFAULT_HOME_STORAGE.into());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(home_pvc_name(&payload.user)),
            namespace: Some(namespace.to_owned()),
            labels: Some(BTreeMap::from([
                ("holodeck.io/app".to_owned(), "home".to_owned()),
                (
                    "holodeck.io/user".to_owned(),
                    sanitize_label(&payload.user),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_owned(), Quantity(storage))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionResources;

    fn payload() -> StartSessionPayload {
        StartSessionPayload {
            session_id: Uuid::parse_str("12345678-1234-1234-1234-123456789abc").unwrap(),
            user: "Alice@Example.com".into(),
            template: "registry.holodeck.io/templates/firefox:latest".into(),
            resources: SessionResources {
                cpu: "2".into(),
                memory: "4Gi".into(),
                storage: None,
            },
            persistent_home: true,
        }
    }

    #[test]
    fn names_are_deterministic() {
        let p = payload();
        assert_eq!(workload_name(p.session_id), "hd-123456781234");
        assert_eq!(service_name(p.session_id), "hd-123456781234-fb");
        assert_eq!(workload_name(p.session_id), workload_name(p.session_id));
    }

    #[test]
    fn user_label_is_sanitized() {
        assert_eq!(sanitize_label("Alice@Example.com"), "alice-example-com");
        assert_eq!(sanitize_label("---"), "anon");
        assert!(sanitize_label(&"x".repeat(100)).len() <= 40);
    }

    #[test]
    fn deployment_has_one_replica_and_labels() {
        let p = payload();
        let deployment = build_deployment(&p, "holodeck-sessions");
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));

        let labels = deployment.metadata.labels.unwrap();
        assert_eq!(labels["holodeck.io/app"], "session");
        assert_eq!(labels["holodeck.io/session"], p.session_id.to_string());
        assert_eq!(labels["holodeck.io/user"], "alice-example-com");
    }

    #[test]
    fn deployment_requests_session_resources() {
        let deployment = build_deployment(&payload(), "ns");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let resources = pod.containers[0].resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("2".into()));
        assert_eq!(requests["memory"], Quantity("4Gi".into()));
    }

    #[test]
    fn persistent_home_mounts_user_pvc() {
        let deployment = build_deployment(&payload(), "ns");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "hd-home-alice-example-com"
        );
        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, HOME_MOUNT_PATH);
    }

    #[test]
    fn ephemeral_home_has_no_volumes() {
        let mut p = payload();
        p.persistent_home = false;
        let deployment = build_deployment(&p, "ns");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod.volumes.is_none());
        assert!(pod.containers[0].volume_mounts.is_none());
    }

    #[test]
    fn service_targets_framebuffer_port() {
        let service = build_service(&payload(), "ns");
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 5900);
        assert_eq!(port.target_port, Some(IntOrString::Int(5900)));
    }

    #[test]
    fn pvc_uses_requested_storage_or_default() {
        let pvc = build_home_pvc(&payload(), "ns");
        let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("10Gi".into()));

        let mut p = payload();
        p.resources.storage = Some("50Gi".into());
        let pvc = build_home_pvc(&p, "ns");
        let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("50Gi".into()));
    }
}
