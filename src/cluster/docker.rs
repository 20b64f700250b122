// ABOUTME: Cluster backed by a single Docker-compatible engine (Docker or Podman).
// ABOUTME: Replicas are labelled containers; desired counts are reconciled by create/remove.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerCreateBody, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info};

use super::{
    ClusterApply, ClusterError, ClusterRead, LABEL_DIGEST, LABEL_REPOSITORY, LABEL_TAG,
    LABEL_WORKLOAD, ReplicaStatus,
};
use crate::types::{ArtifactRef, Digest, ReplicaId, WorkloadId};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone)]
pub struct DockerCluster {
    client: Docker,
    network: Option<String>,
    credentials: Option<DockerCredentials>,
    env: HashMap<WorkloadId, Vec<String>>,
}

/// A replica container as listed by the engine.
struct Listed {
    id: String,
    name: String,
    running: bool,
}

impl DockerCluster {
    pub fn new(client: Docker) -> Self {
        Self {
            client,
            network: None,
            credentials: None,
            env: HashMap::new(),
        }
    }

    /// Connect to the engine at `socket`, or the local Docker socket.
    pub fn connect(socket: Option<&str>) -> Result<Self, ClusterError> {
        let socket = socket.unwrap_or(DOCKER_SOCKET);
        let client = Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| ClusterError::Connection {
                message: format!("{socket}: {e}"),
            })?;
        Ok(Self::new(client))
    }

    /// Engine client, shared with the registry lookup.
    pub fn client(&self) -> &Docker {
        &self.client
    }

    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some(DockerCredentials {
            username: Some(username),
            password: Some(password),
            ..Default::default()
        });
        self
    }

    /// Environment passed to every replica of `workload`, as `KEY=value` pairs.
    pub fn with_workload_env(mut self, workload: WorkloadId, env: Vec<String>) -> Self {
        self.env.insert(workload, env);
        self
    }

    async fn list(
        &self,
        workload: &WorkloadId,
        digest: Option<&Digest>,
    ) -> Result<Vec<Listed>, ClusterError> {
        let mut labels = vec![format!("{LABEL_WORKLOAD}={workload}")];
        if let Some(digest) = digest {
            labels.push(format!("{LABEL_DIGEST}={digest}"));
        }
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), labels);

        let opts = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(opts))
            .await
            .map_err(|e| operation_error("list", workload, e))?;

        let mut listed: Vec<Listed> = containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let running = c
                    .state
                    .map(|s| format!("{s:?}").eq_ignore_ascii_case("running"))
                    .unwrap_or(false);
                Some(Listed { id, name, running })
            })
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn remove(&self, workload: &WorkloadId, id: &str) -> Result<(), ClusterError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(opts)).await {
            Ok(()) => Ok(()),
            // Already gone counts as removed.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(operation_error("remove", workload, e)),
        }
    }

    async fn pull(&self, workload: &WorkloadId, artifact: &ArtifactRef) -> Result<(), ClusterError> {
        let opts = CreateImageOptions {
            from_image: Some(artifact.pinned()),
            ..Default::default()
        };
        let mut stream = self
            .client
            .create_image(Some(opts), None, self.credentials.clone());
        while let Some(result) = stream.next().await {
            result.map_err(|e| operation_error("pull", workload, e))?;
        }
        Ok(())
    }

    async fn create(&self, workload: &WorkloadId, artifact: &ArtifactRef) -> Result<(), ClusterError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}",
            workload,
            artifact.digest().short(),
            &suffix[..8]
        );

        let labels = HashMap::from([
            (LABEL_WORKLOAD.to_string(), workload.to_string()),
            (LABEL_DIGEST.to_string(), artifact.digest().to_string()),
            (LABEL_REPOSITORY.to_string(), artifact.repository().to_string()),
            (LABEL_TAG.to_string(), artifact.tag().to_string()),
        ]);

        let env = self.env.get(workload).cloned().filter(|e| !e.is_empty());

        let body = ContainerCreateBody {
            image: Some(artifact.pinned()),
            env,
            labels: Some(labels),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                network_mode: self.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };

        let created = match self
            .client
            .create_container(Some(opts.clone()), body.clone())
            .await
        {
            Ok(created) => created,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(workload = %workload, image = %artifact.pinned(), "image not present, pulling");
                self.pull(workload, artifact).await?;
                self.client
                    .create_container(Some(opts), body)
                    .await
                    .map_err(|e| operation_error("create", workload, e))?
            }
            Err(e) => return Err(operation_error("create", workload, e)),
        };

        self.client
            .start_container(
                &created.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .map_err(|e| operation_error("start", workload, e))?;

        info!(workload = %workload, replica = %name, "replica started");
        Ok(())
    }
}

#[async_trait]
impl ClusterApply for DockerCluster {
    async fn set_workload(
        &self,
        workload: &WorkloadId,
        replicas: u32,
        artifact: &ArtifactRef,
    ) -> Result<(), ClusterError> {
        let existing = self.list(workload, Some(artifact.digest())).await?;

        // Stopped replicas never come back on their own.
        let (running, stopped): (Vec<_>, Vec<_>) = existing.into_iter().partition(|c| c.running);
        for container in &stopped {
            self.remove(workload, &container.id).await?;
        }

        let desired = replicas as usize;
        if running.len() > desired {
            for container in running.iter().rev().take(running.len() - desired) {
                info!(workload = %workload, replica = %container.name, "removing replica");
                self.remove(workload, &container.id).await?;
            }
        } else {
            for _ in running.len()..desired {
                self.create(workload, artifact).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterRead for DockerCluster {
    async fn readiness_of(&self, workload: &WorkloadId) -> Result<Vec<ReplicaStatus>, ClusterError> {
        let listed = self.list(workload, None).await?;
        let mut statuses = Vec::with_capacity(listed.len());

        for container in listed.into_iter().filter(|c| c.running) {
            let details = match self
                .client
                .inspect_container(&container.id, None::<InspectContainerOptions>)
                .await
            {
                Ok(details) => details,
                // Removed between list and inspect.
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => continue,
                Err(e) => return Err(operation_error("inspect", workload, e)),
            };

            let labels = details
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default();
            let Some(digest) = labels.get(LABEL_DIGEST).and_then(|d| Digest::parse(d).ok()) else {
                continue;
            };

            let running = details
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);
            // Without an engine healthcheck, running is the readiness signal.
            let ready = match details
                .state
                .as_ref()
                .and_then(|s| s.health.as_ref())
                .and_then(|h| h.status)
            {
                Some(bollard::models::HealthStatusEnum::HEALTHY) => running,
                Some(bollard::models::HealthStatusEnum::STARTING)
                | Some(bollard::models::HealthStatusEnum::UNHEALTHY) => false,
                _ => running,
            };

            let address = details
                .network_settings
                .as_ref()
                .and_then(|n| n.networks.as_ref())
                .and_then(|nets| {
                    let endpoint = match &self.network {
                        Some(name) => nets.get(name),
                        None => nets.values().next(),
                    }?;
                    endpoint.ip_address.as_deref()?.parse::<IpAddr>().ok()
                });

            statuses.push(ReplicaStatus {
                id: ReplicaId::new(container.name),
                digest,
                ready,
                address,
            });
        }

        Ok(statuses)
    }
}

fn operation_error(
    operation: &'static str,
    workload: &WorkloadId,
    e: bollard::errors::Error,
) -> ClusterError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } if (400..500).contains(status_code) && *status_code != 404 && *status_code != 409 => {
            ClusterError::Rejected {
                workload: workload.clone(),
                message: message.clone(),
            }
        }
        _ => ClusterError::Operation {
            operation,
            workload: workload.clone(),
            message: e.to_string(),
        },
    }
}
