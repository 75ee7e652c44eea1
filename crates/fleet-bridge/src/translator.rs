//! Outbound translation of a workload into a compose application entry.

use std::collections::BTreeMap;

use common::api::{APP_TYPE_COMPOSE, Application, COMPOSE_INLINE_PATH, InlineContent};
use serde::Serialize;

use crate::error::BridgeError;
use crate::workload::{ContainerSpec, EnvValue, RestartPolicy, Workload};

const COMPOSE_VERSION: &str = "3.8";

#[derive(Debug, Serialize)]
struct ComposeFile {
    version: &'static str,
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    environment: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    restart: &'static str,
    /// Indirect env sources the device cannot resolve; ignored by compose.
    #[serde(rename = "x-unresolved-env", skip_serializing_if = "BTreeMap::is_empty")]
    unresolved_env: BTreeMap<String, String>,
}

fn restart_value(policy: RestartPolicy) -> &'static str {
    match policy {
        RestartPolicy::Always => "unless-stopped",
        RestartPolicy::Never => "no",
        RestartPolicy::OnFailure => "on-failure",
    }
}

/// Compose service names are lowercase and dot-free.
pub fn service_name(container: &str) -> String {
    container.to_lowercase().replace('.', "-")
}

fn service(container: &ContainerSpec, restart: &'static str) -> ComposeService {
    let mut environment = Vec::new();
    let mut unresolved_env = BTreeMap::new();
    for var in &container.env {
        match &var.value {
            EnvValue::Literal(value) => environment.push(format!("{}={}", var.name, value)),
            EnvValue::SecretKeyRef { name, key } => {
                unresolved_env.insert(var.name.clone(), format!("secret/{name}/{key}"));
            }
            EnvValue::ConfigMapKeyRef { name, key } => {
                unresolved_env.insert(var.name.clone(), format!("configmap/{name}/{key}"));
            }
            EnvValue::FieldRef { path } => {
                unresolved_env.insert(var.name.clone(), format!("field/{path}"));
            }
        }
    }

    let ports = container
        .ports
        .iter()
        .map(|port| {
            let mapping = format!("{0}:{0}", port.container_port);
            match port.protocol.as_deref().map(str::to_ascii_lowercase) {
                Some(proto) if proto == "udp" => format!("{mapping}/udp"),
                _ => mapping,
            }
        })
        .collect();

    ComposeService {
        image: container.image.clone(),
        entrypoint: container.command.clone(),
        command: container.args.clone(),
        environment,
        ports,
        restart,
        unresolved_env,
    }
}

/// Renders the compose document for `workload`.
pub fn render_compose(workload: &Workload) -> Result<String, serde_yaml::Error> {
    let restart = restart_value(workload.restart_policy);
    let services = workload
        .containers
        .iter()
        .map(|container| (service_name(&container.name), service(container, restart)))
        .collect();
    serde_yaml::to_string(&ComposeFile {
        version: COMPOSE_VERSION,
        services,
    })
}

/// Builds the application entry named `<namespace>-<name>` for `workload`.
pub fn to_application(workload: &Workload) -> Result<Application, BridgeError> {
    let key = workload.key();
    let content = render_compose(workload).map_err(|source| BridgeError::Translation {
        key: key.to_string(),
        source,
    })?;
    Ok(Application {
        name: key.app_name(),
        app_type: APP_TYPE_COMPOSE.to_string(),
        inline: vec![InlineContent {
            path: COMPOSE_INLINE_PATH.to_string(),
            content,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{ContainerPort, EnvVar};

    fn workload() -> Workload {
        Workload {
            namespace: "shop".into(),
            name: "api".into(),
            uid: "uid-1".into(),
            containers: vec![ContainerSpec {
                name: "Web.Frontend".into(),
                image: "nginx:1.27".into(),
                command: vec!["/bin/sh".into(), "-c".into()],
                args: vec!["nginx -g 'daemon off;'".into()],
                env: vec![
                    EnvVar::literal("MODE", "edge"),
                    EnvVar {
                        name: "DB_PASSWORD".into(),
                        value: EnvValue::SecretKeyRef {
                            name: "db".into(),
                            key: "password".into(),
                        },
                    },
                ],
                ports: vec![
                    ContainerPort {
                        container_port: 8080,
                        protocol: None,
                    },
                    ContainerPort {
                        container_port: 5353,
                        protocol: Some("UDP".into()),
                    },
                ],
                ..Default::default()
            }],
            restart_policy: RestartPolicy::OnFailure,
            ..Default::default()
        }
    }

    #[test]
    fn application_entry_carries_compose_inline_file() {
        let app = to_application(&workload()).expect("translated");
        assert_eq!(app.name, "shop-api");
        assert_eq!(app.app_type, "compose");
        assert_eq!(app.inline.len(), 1);
        assert_eq!(app.inline[0].path, "podman-compose.yaml");
    }

    #[test]
    fn compose_document_maps_container_fields() {
        let yaml = render_compose(&workload()).expect("rendered");
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid yaml");

        assert_eq!(doc["version"].as_str(), Some("3.8"));
        let svc = &doc["services"]["web-frontend"];
        assert_eq!(svc["image"].as_str(), Some("nginx:1.27"));
        assert_eq!(svc["entrypoint"][0].as_str(), Some("/bin/sh"));
        assert_eq!(svc["command"][0].as_str(), Some("nginx -g 'daemon off;'"));
        assert_eq!(svc["environment"][0].as_str(), Some("MODE=edge"));
        assert_eq!(svc["environment"].as_sequence().map(Vec::len), Some(1));
        assert_eq!(svc["ports"][0].as_str(), Some("8080:8080"));
        assert_eq!(svc["ports"][1].as_str(), Some("5353:5353/udp"));
        assert_eq!(svc["restart"].as_str(), Some("on-failure"));
        assert_eq!(
            svc["x-unresolved-env"]["DB_PASSWORD"].as_str(),
            Some("secret/db/password")
        );
    }

    #[test]
    fn restart_policies_map_to_compose_values() {
        assert_eq!(restart_value(RestartPolicy::Always), "unless-stopped");
        assert_eq!(restart_value(RestartPolicy::Never), "no");
        assert_eq!(restart_value(RestartPolicy::OnFailure), "on-failure");
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let minimal = Workload {
            namespace: "default".into(),
            name: "bare".into(),
            containers: vec![ContainerSpec {
                name: "app".into(),
                image: "busybox".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let yaml = render_compose(&minimal).expect("rendered");
        assert!(!yaml.contains("entrypoint"), "{yaml}");
        assert!(!yaml.contains("x-unresolved-env"), "{yaml}");
        assert!(yaml.contains("restart: unless-stopped"), "{yaml}");
    }
}
