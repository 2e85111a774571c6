//! The bit-exact JSON shape `CreateContainer` sends to Docker's
//! `/containers/create` endpoint (§6, §8 testable properties 4 and 6).
//!
//! This is deliberately a plain, independently serializable struct rather
//! than going through `bollard::container::Config` directly (the teacher's
//! `ContainerRunner::start_container` builds that inline) — so the exact
//! wire shape can be asserted on in a unit test without a live
//! `bollard::Docker` handle, and so the request is reusable across both the
//! live `BollardDockerClient` and the `FakeDockerClient` used in tests.
//!
//! Determinism: every collection here is ordered (`BTreeMap`, or a `Vec`
//! built in a fixed order) so `to_json` always produces the same string for
//! the same logical request, independent of `HashMap` iteration order.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::model::{Container, HealthCheckConfig, PortMapping, UserAndGroup};

#[derive(Debug, Clone, Serialize)]
pub struct PortBindingJson {
    #[serde(rename = "HostIp")]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostConfigJson {
    #[serde(rename = "NetworkMode")]
    pub network_mode: String,
    #[serde(rename = "Binds")]
    pub binds: Vec<String>,
    #[serde(rename = "PortBindings")]
    pub port_bindings: BTreeMap<String, Vec<PortBindingJson>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthcheckJson {
    #[serde(rename = "Test")]
    pub test: Vec<String>,
    #[serde(rename = "Interval")]
    pub interval: u64,
    #[serde(rename = "Retries")]
    pub retries: u64,
    #[serde(rename = "StartPeriod")]
    pub start_period: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointConfigJson {
    #[serde(rename = "Aliases")]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkingConfigJson {
    #[serde(rename = "EndpointsConfig")]
    pub endpoints_config: BTreeMap<String, EndpointConfigJson>,
}

/// The full `/containers/create` request body (§6).
#[derive(Debug, Clone, Serialize)]
pub struct DockerContainerCreationRequest {
    #[serde(rename = "AttachStdin")]
    pub attach_stdin: bool,
    #[serde(rename = "AttachStdout")]
    pub attach_stdout: bool,
    #[serde(rename = "AttachStderr")]
    pub attach_stderr: bool,
    #[serde(rename = "Tty")]
    pub tty: bool,
    #[serde(rename = "OpenStdin")]
    pub open_stdin: bool,
    #[serde(rename = "StdinOnce")]
    pub stdin_once: bool,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Cmd", skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfigJson,
    #[serde(rename = "Healthcheck")]
    pub healthcheck: HealthcheckJson,
    #[serde(rename = "NetworkingConfig")]
    pub networking_config: NetworkingConfigJson,
}

impl DockerContainerCreationRequest {
    /// Builds the request for `container`, to be attached to `network_name`
    /// under a single alias equal to the container's declared name (§4.3).
    ///
    /// `command` is the already-resolved `Cmd` array (container-declared or
    /// the split, quote-aware override from `command_line::split_command_line`).
    /// `host_term` is the value of the host console's `TERM`, forwarded
    /// unless the container itself declares one (§4.3).
    pub fn build(
        container: &Container,
        image: &str,
        network_name: &str,
        command: Vec<String>,
        env_overrides: &BTreeMap<String, String>,
        host_term: Option<&str>,
    ) -> Self {
        let mut env: BTreeMap<String, String> = container.environment.clone();
        for (k, v) in env_overrides {
            env.insert(k.clone(), v.clone());
        }
        if !env.contains_key("TERM") {
            if let Some(term) = host_term {
                env.insert("TERM".to_owned(), term.to_owned());
            }
        }
        let env: Vec<String> = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();

        let binds: Vec<String> = container
            .volume_mounts
            .iter()
            .map(|m| {
                let m = &m.0;
                match &m.options {
                    Some(opts) => format!("{}:{}:{}", m.host_path, m.container_path, opts),
                    None => format!("{}:{}", m.host_path, m.container_path),
                }
            })
            .collect();

        let port_bindings = port_bindings_json(&container.port_mappings);

        let healthcheck = healthcheck_json(&container.health_check);

        let user = container.user_and_group.as_ref().map(user_string);

        let mut endpoints_config = BTreeMap::new();
        endpoints_config.insert(
            network_name.to_owned(),
            EndpointConfigJson {
                aliases: vec![container.name.clone()],
            },
        );

        Self {
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: true,
            open_stdin: true,
            stdin_once: true,
            image: image.to_owned(),
            cmd: command,
            hostname: container.name.clone(),
            working_dir: container.working_dir.clone(),
            user,
            env,
            host_config: HostConfigJson {
                network_mode: network_name.to_owned(),
                binds,
                port_bindings,
            },
            healthcheck,
            networking_config: NetworkingConfigJson { endpoints_config },
        }
    }

    /// Deterministic JSON string for this request (§8 property 4).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("DockerContainerCreationRequest always serializes")
    }
}

fn user_string(ug: &UserAndGroup) -> String {
    format!("{}:{}", ug.uid, ug.gid)
}

fn port_bindings_json(
    mappings: &std::collections::BTreeSet<PortMapping>,
) -> BTreeMap<String, Vec<PortBindingJson>> {
    let mut out: BTreeMap<String, Vec<PortBindingJson>> = BTreeMap::new();
    for mapping in mappings {
        out.entry(format!("{}/tcp", mapping.container_port))
            .or_default()
            .push(PortBindingJson {
                host_ip: String::new(),
                host_port: mapping.host_port.to_string(),
            });
    }
    out
}

fn healthcheck_json(config: &HealthCheckConfig) -> HealthcheckJson {
    fn nanos(d: Option<Duration>) -> u64 {
        d.map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }

    HealthcheckJson {
        // An empty `Test` means "use whatever the image itself declares"
        // (§4.3); the engine only ever overrides the timing fields.
        test: vec![],
        interval: nanos(config.interval),
        retries: u64::from(config.retries.unwrap_or(0)),
        start_period: nanos(config.start_period),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, ImageSource};
    use std::collections::BTreeSet;

    fn minimal_container() -> Container {
        Container {
            name: "svc".into(),
            image_source: ImageSource::Pull {
                reference: "alpine:latest".into(),
            },
            command: None,
            environment: BTreeMap::new(),
            working_dir: None,
            volume_mounts: BTreeSet::new(),
            port_mappings: BTreeSet::new(),
            health_check: HealthCheckConfig::default(),
            user_and_group: None,
            dependencies: BTreeSet::new(),
        }
    }

    #[test]
    fn minimal_request_matches_expected_skeleton() {
        let container = minimal_container();
        let request = DockerContainerCreationRequest::build(
            &container,
            "alpine:latest",
            "batect-task-net",
            vec![],
            &BTreeMap::new(),
            None,
        );
        let json: serde_json::Value = serde_json::from_str(&request.to_json()).unwrap();

        assert!(json.get("Cmd").is_none());
        assert_eq!(json["Env"], serde_json::json!([]));
        assert_eq!(json["HostConfig"]["Binds"], serde_json::json!([]));
        assert_eq!(json["HostConfig"]["PortBindings"], serde_json::json!({}));
        assert_eq!(json["Healthcheck"]["Interval"], 0);
        assert_eq!(json["Healthcheck"]["Retries"], 0);
        assert_eq!(json["Healthcheck"]["StartPeriod"], 0);
        assert!(json.get("WorkingDir").is_none());
        assert!(json.get("User").is_none());
        assert_eq!(json["AttachStdin"], true);
        assert_eq!(json["StdinOnce"], true);
    }

    #[test]
    fn to_json_is_deterministic_across_calls() {
        let container = minimal_container();
        let a = DockerContainerCreationRequest::build(
            &container,
            "alpine:latest",
            "net",
            vec!["sh".into(), "-c".into(), "true".into()],
            &BTreeMap::new(),
            Some("xterm-256color"),
        );
        let b = DockerContainerCreationRequest::build(
            &container,
            "alpine:latest",
            "net",
            vec!["sh".into(), "-c".into(), "true".into()],
            &BTreeMap::new(),
            Some("xterm-256color"),
        );
        assert_eq!(a.to_json(), b.to_json());
    }

    #[test]
    fn declared_term_wins_over_host_term() {
        let mut container = minimal_container();
        container
            .environment
            .insert("TERM".to_owned(), "screen".to_owned());
        let request = DockerContainerCreationRequest::build(
            &container,
            "alpine:latest",
            "net",
            vec![],
            &BTreeMap::new(),
            Some("xterm-256color"),
        );
        assert!(request.env.contains(&"TERM=screen".to_owned()));
        assert!(!request.env.iter().any(|e| e == "TERM=xterm-256color"));
    }

    #[test]
    fn host_term_forwarded_when_unset() {
        let container = minimal_container();
        let request = DockerContainerCreationRequest::build(
            &container,
            "alpine:latest",
            "net",
            vec![],
            &BTreeMap::new(),
            Some("xterm-256color"),
        );
        assert!(request.env.contains(&"TERM=xterm-256color".to_owned()));
    }
}
