//! Image-drift detection and container replacement.
//!
//! A container opts into drift checks with the `update` label. A check
//! pulls the container's image tag and compares the id the tag now points
//! at with the id the container was created from. On a mismatch the
//! container is swapped for a fresh one built from the service descriptor.
//!
//! Swaps are serialized host-wide through `Operator::replacing`. A swap is
//! not transactional: once the old container is removed there is no way
//! back, so failures past that point are reported as
//! [`OperatorError::Partial`]. A successor that was created but would not
//! start is remembered and retried by [`Operator::retry_pending`].

use std::collections::HashMap;

use bollard::models::HostConfig;
use log::{error, info, warn};

use crate::error::{EngineError, OperatorError, ReplaceStage, Result};
use crate::labels::COMPOSE_IMAGE_LABEL;
use crate::operator::Operator;
use crate::runtime::{ContainerDetail, ContainerSpec, RegistryAuth};
use crate::types::{EndpointConfig, PendingStart};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftOutcome {
    /// The container does not carry the `update` label.
    Skipped,
    UpToDate,
    /// Replaced by the container with this id.
    Replaced(String),
}

/// Input to [`Operator::replace`].
#[derive(Debug, Clone)]
pub struct ReplaceRequest {
    pub old: ContainerDetail,
    /// Image reference the successor is created from.
    pub image: String,
    pub labels: HashMap<String, String>,
    pub endpoints: EndpointConfig,
    /// Image id to delete once the old container is gone.
    pub remove_image: Option<String>,
}

impl Operator {
    pub async fn check_drift(&self, container_id: &str) -> Result<DriftOutcome> {
        let detail = self.engine.inspect_container(container_id).await?;
        if !self.keys.parse(&detail.labels).update {
            return Ok(DriftOutcome::Skipped);
        }

        let tag = self.image_reference(&detail).await?;
        let endpoints = EndpointConfig::capture(&detail.networks, &detail.id);

        info!("Pulling image {} for {}", tag, detail.name);
        self.pull(&tag).await?;

        let latest = self.engine.inspect_image(&tag).await?;
        if latest.id == detail.image_id {
            info!("Container {} is up to date", detail.name);
            return Ok(DriftOutcome::UpToDate);
        }

        info!(
            "Image drift on {}: bound {}, latest {}",
            detail.name, detail.image_id, latest.id
        );
        let mut labels = detail.labels.clone();
        labels.insert(COMPOSE_IMAGE_LABEL.to_string(), latest.id.clone());
        let remove_image = Some(detail.image_id.clone());

        let new_id = self
            .replace(ReplaceRequest {
                old: detail,
                image: tag,
                labels,
                endpoints,
                remove_image,
            })
            .await?;
        Ok(DriftOutcome::Replaced(new_id))
    }

    /// Swaps a container for a fresh one with its current image, without
    /// pulling.
    pub async fn recreate(&self, container_id: &str) -> Result<String> {
        let detail = self.engine.inspect_container(container_id).await?;
        let image = self.image_reference(&detail).await?;
        let endpoints = EndpointConfig::capture(&detail.networks, &detail.id);
        let labels = detail.labels.clone();
        self.replace(ReplaceRequest {
            old: detail,
            image,
            labels,
            endpoints,
            remove_image: None,
        })
        .await
    }

    /// Stops, removes and recreates a container. Returns the new id.
    pub async fn replace(&self, request: ReplaceRequest) -> Result<String> {
        let _guard = self.replacing.lock().await;
        let ReplaceRequest {
            old,
            image,
            mut labels,
            endpoints,
            remove_image,
        } = request;

        // Resolve before touching the old container so a descriptor
        // problem leaves it running.
        let service = self.service_for(&image)?;
        let networks = self.desired_networks(&service);

        self.engine.kill_container(&old.id).await?;
        self.engine.remove_container(&old.id).await?;
        self.registry.remove(&old.id).await;
        info!("Container stopped: {} ({})", old.name, old.id);

        if let Some(image_id) = remove_image {
            if let Err(e) = self.engine.remove_image(&image_id).await {
                warn!("Could not remove old image {}: {}", image_id, e);
            }
        }

        let compose_image = labels.get(COMPOSE_IMAGE_LABEL).cloned();
        labels.extend(service.labels);
        if let Some(id) = compose_image {
            labels.insert(COMPOSE_IMAGE_LABEL.to_string(), id);
        }
        let parsed = self.keys.parse(&labels);

        let mut host_config = old.host_config;
        if parsed.dns_required {
            self.apply_resolvers(&mut host_config).await;
        }
        let mut env = service.env;
        if parsed.with_drivers {
            env.push(self.drivers.lock().await.to_env());
        }

        let spec = ContainerSpec {
            name: old.name.clone(),
            image,
            env,
            cmd: service.command,
            exposed_ports: service.ports,
            volumes: service.volumes,
            labels,
            host_config,
        };

        let partial = |stage: ReplaceStage| {
            let container = old.name.clone();
            move |source: EngineError| OperatorError::Partial {
                container,
                stage,
                source,
            }
        };

        let new_id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(partial(ReplaceStage::Create))?;

        if let Err(source) = self.engine.start_container(&new_id).await {
            self.pending.lock().await.insert(
                new_id.clone(),
                PendingStart {
                    container_id: new_id.clone(),
                    name: old.name.clone(),
                    networks,
                    endpoints,
                },
            );
            return Err(partial(ReplaceStage::Start)(source));
        }

        let detail = self
            .engine
            .inspect_container(&new_id)
            .await
            .map_err(partial(ReplaceStage::Register))?;
        self.registry.upsert(detail.to_record()).await;
        info!("Container started: {} -> {}", old.name, new_id);

        if let Err(e) = self.reattach(&new_id, &networks, &endpoints).await {
            error!("Reattaching networks for {} failed: {}", old.name, e);
        }
        Ok(new_id)
    }

    /// Retries successors that were created but failed to start.
    pub async fn retry_pending(&self) {
        let pending: Vec<PendingStart> = self.pending.lock().await.values().cloned().collect();
        for entry in pending {
            let _guard = self.replacing.lock().await;
            match self.engine.start_container(&entry.container_id).await {
                Ok(()) => {
                    self.pending.lock().await.remove(&entry.container_id);
                    info!("Pending container {} started", entry.name);
                    match self.engine.inspect_container(&entry.container_id).await {
                        Ok(detail) => self.registry.upsert(detail.to_record()).await,
                        Err(e) => warn!("Inspecting {} failed: {}", entry.name, e),
                    }
                    if let Err(e) = self
                        .reattach(&entry.container_id, &entry.networks, &entry.endpoints)
                        .await
                    {
                        error!("Reattaching networks for {} failed: {}", entry.name, e);
                    }
                }
                Err(EngineError::ContainerNotFound(_)) => {
                    warn!("Pending container {} is gone, giving up", entry.name);
                    self.pending.lock().await.remove(&entry.container_id);
                }
                Err(e) => warn!("Pending container {} still fails to start: {}", entry.name, e),
            }
        }
    }

    /// Pulls `reference` anonymously, then with each configured registry,
    /// stopping at the first success.
    pub(crate) async fn pull(&self, reference: &str) -> Result<()> {
        let attempts = std::iter::once(None).chain(self.config.registries.iter().map(Some));
        for auth in attempts {
            match self.engine.pull_image(reference, auth).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    "Pulling {} ({}) failed: {}",
                    reference,
                    describe(auth),
                    e
                ),
            }
        }
        Err(OperatorError::PullFailed(reference.to_string()))
    }

    /// Tag the container's image is known by. Falls back to the reference in
    /// the container config when the bound image lost its tags to a newer
    /// pull.
    async fn image_reference(&self, detail: &ContainerDetail) -> Result<String> {
        let tags = match self.engine.inspect_image(&detail.image_id).await {
            Ok(image) => image.repo_tags,
            Err(e) => {
                warn!("Inspecting image {} failed: {}", detail.image_id, e);
                Vec::new()
            }
        };
        tags.into_iter()
            .find(|t| !t.is_empty() && t != "<none>:<none>")
            .or_else(|| {
                let configured = &detail.image;
                (!configured.is_empty() && !configured.starts_with("sha256:"))
                    .then(|| configured.clone())
            })
            .ok_or_else(|| OperatorError::NoImageTag(detail.image_id.clone()))
    }

    async fn apply_resolvers(&self, host_config: &mut HostConfig) {
        let mut servers = Vec::new();
        match self.dns_publisher().await {
            Some(publisher) => servers.push(publisher.target().resolver_ip.clone()),
            None => warn!("No DNS server discovered, using fallback resolvers only"),
        }
        servers.extend(self.config.dns.iter().cloned());
        host_config.dns = Some(servers);
        host_config.dns_search = Some(Vec::new());
        host_config.dns_options = Some(Vec::new());
    }
}

fn describe(auth: Option<&RegistryAuth>) -> String {
    match auth {
        Some(auth) => format!("{}@{}", auth.username, auth.server_address),
        None => "anonymous".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::operator::testing::{dns_target, harness, Harness};
    use crate::runtime::mock::Call;

    const COMPOSE: &str = r#"
services:
  api:
    image: app:v1
    environment:
      MODE: production
    networks: [proxy]
  worker:
    image: worker:v1
    labels:
      team: jobs
    networks: [proxy]
"#;

    fn drifted(h: &Harness) {
        h.engine.add_network("n-proxy", "app_proxy");
        h.engine.add_image("app:v1", "sha:aaa");
        h.engine.publish_remote("app:v1", "sha:bbb");
    }

    fn creates(h: &Harness) -> usize {
        h.engine
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Create(_)))
            .count()
    }

    #[tokio::test]
    async fn containers_without_update_label_are_skipped() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine.add_container("c1", "api", "app:v1", &[]);

        let outcome = h.operator.check_drift("c1").await.unwrap();

        assert_eq!(outcome, DriftOutcome::Skipped);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn drifted_container_is_replaced() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine
            .add_container("c1", "api", "app:v1", &[("nocloud.update", "true")]);
        h.operator.refresh().await.unwrap();

        let outcome = h.operator.check_drift("c1").await.unwrap();

        let DriftOutcome::Replaced(new_id) = outcome else {
            panic!("expected a replacement, got {:?}", outcome);
        };
        assert!(h.engine.container("c1").is_none());
        assert!(!h.engine.has_image("sha:aaa"));
        assert!(h.operator.registry().get("c1").await.is_none());

        let record = h.operator.registry().get(&new_id).await.unwrap();
        assert_eq!(record.image, "app:v1");
        let detail = h.engine.container(&new_id).unwrap();
        assert_eq!(detail.image_id, "sha:bbb");
        assert_eq!(detail.name, "api");
        assert_eq!(detail.labels[COMPOSE_IMAGE_LABEL], "sha:bbb");
        assert_eq!(detail.labels["nocloud.update"], "true");
        assert!(detail.networks.contains_key("app_proxy"));

        let spec = &h.engine.created_specs()[0];
        assert_eq!(spec.env, vec!["MODE=production".to_string()]);
    }

    #[tokio::test]
    async fn second_check_without_new_image_does_nothing() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine
            .add_container("c1", "api", "app:v1", &[("nocloud.update", "true")]);

        let DriftOutcome::Replaced(new_id) = h.operator.check_drift("c1").await.unwrap() else {
            panic!("first check should replace");
        };
        let outcome = h.operator.check_drift(&new_id).await.unwrap();

        assert_eq!(outcome, DriftOutcome::UpToDate);
        assert_eq!(creates(&h), 1);
    }

    #[tokio::test]
    async fn pull_falls_through_credentials() {
        let h = harness(COMPOSE, |c| {
            c.registries = vec![
                RegistryAuth {
                    username: "ci".into(),
                    password: "x".into(),
                    server_address: "registry.a".into(),
                },
                RegistryAuth {
                    username: "ci".into(),
                    password: "y".into(),
                    server_address: "registry.b".into(),
                },
            ];
        });
        drifted(&h);
        h.engine.reject_registry("");
        h.engine.reject_registry("registry.a");

        h.operator.pull("app:v1").await.unwrap();

        let pulls = h
            .engine
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Pull(_)))
            .count();
        assert_eq!(pulls, 3);
    }

    #[tokio::test]
    async fn exhausted_credentials_abort_before_stopping() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine.reject_registry("");
        h.engine
            .add_container("c1", "api", "app:v1", &[("nocloud.update", "true")]);

        let err = h.operator.check_drift("c1").await.unwrap_err();

        assert!(matches!(err, OperatorError::PullFailed(_)));
        assert!(h.engine.container("c1").is_some());
        assert!(!h.engine.calls().contains(&Call::Kill("c1".into())));
    }

    #[tokio::test]
    async fn missing_service_leaves_old_container_running() {
        let h = harness("services: {}\n", |_| {});
        drifted(&h);
        h.engine
            .add_container("c1", "api", "app:v1", &[("nocloud.update", "true")]);

        let err = h.operator.check_drift("c1").await.unwrap_err();

        assert!(matches!(err, OperatorError::NoService(_)));
        assert!(h.engine.container("c1").is_some());
    }

    #[tokio::test]
    async fn dns_required_gets_discovered_resolver_first() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine.add_container(
            "c1",
            "api",
            "app:v1",
            &[("nocloud.update", "true"), ("nocloud.dns.required", "true")],
        );
        h.operator.install_dns(dns_target()).await.unwrap();

        h.operator.check_drift("c1").await.unwrap();

        let host = &h.engine.created_specs()[0].host_config;
        assert_eq!(
            host.dns,
            Some(vec!["10.0.0.2".to_string(), "1.1.1.1".to_string()])
        );
        assert_eq!(host.dns_search, Some(Vec::new()));
        assert_eq!(host.dns_options, Some(Vec::new()));
    }

    #[tokio::test]
    async fn with_drivers_gets_drivers_env() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine.add_container(
            "c1",
            "api",
            "app:v1",
            &[("nocloud.update", "true"), ("nocloud.with-drivers", "true")],
        );
        *h.operator.drivers.lock().await =
            crate::types::DriverSet::new(vec!["ione:8080".into(), "aws:8080".into()]);

        h.operator.check_drift("c1").await.unwrap();

        let env = &h.engine.created_specs()[0].env;
        assert!(env.contains(&"DRIVERS=aws:8080 ione:8080".to_string()));
    }

    #[tokio::test]
    async fn failed_start_is_partial_and_retried() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine
            .add_container("c1", "api", "app:v1", &[("nocloud.update", "true")]);
        h.engine.fail_starts(true);

        let err = h.operator.check_drift("c1").await.unwrap_err();
        assert!(matches!(
            err,
            OperatorError::Partial {
                stage: ReplaceStage::Start,
                ..
            }
        ));
        assert_eq!(h.operator.pending.lock().await.len(), 1);
        assert_eq!(h.operator.registry().len().await, 0);

        h.engine.fail_starts(false);
        h.operator.retry_pending().await;

        assert!(h.operator.pending.lock().await.is_empty());
        let snapshot = h.operator.registry().snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].names, vec!["api".to_string()]);
        let detail = h.engine.container(&snapshot[0].id).unwrap();
        assert!(detail.networks.contains_key("app_proxy"));
    }

    #[tokio::test]
    async fn recreate_keeps_image_and_skips_pull() {
        let h = harness(COMPOSE, |_| {});
        h.engine.add_network("n-proxy", "app_proxy");
        h.engine.add_image("worker:v1", "sha:www");
        h.engine.add_container("w1", "worker", "worker:v1", &[("team", "old")]);

        let new_id = h.operator.recreate("w1").await.unwrap();

        let detail = h.engine.container(&new_id).unwrap();
        assert_eq!(detail.image_id, "sha:www");
        assert_eq!(detail.labels["team"], "jobs");
        assert!(h.engine.has_image("sha:www"));
        assert!(!h
            .engine
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Pull(_) | Call::RemoveImage(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replacements_do_not_interleave() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine.add_image("worker:v1", "sha:w1");
        h.engine.publish_remote("worker:v1", "sha:w2");
        h.engine
            .add_container("c1", "api", "app:v1", &[("nocloud.update", "true")]);
        h.engine
            .add_container("c2", "worker", "worker:v1", &[("nocloud.update", "true")]);

        let mut tasks = tokio::task::JoinSet::new();
        for id in ["c1", "c2"] {
            let operator = Arc::clone(&h.operator);
            tasks.spawn(async move { operator.check_drift(id).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(matches!(result.unwrap(), Ok(DriftOutcome::Replaced(_))));
        }

        let lifecycle: Vec<Call> = h
            .engine
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::Kill(_) | Call::RemoveContainer(_) | Call::Create(_) | Call::Start(_)
                )
            })
            .collect();
        assert_eq!(lifecycle.len(), 8);
        for swap in lifecycle.chunks(4) {
            assert!(matches!(swap[0], Call::Kill(_)));
            assert!(matches!(swap[1], Call::RemoveContainer(_)));
            assert!(matches!(swap[2], Call::Create(_)));
            assert!(matches!(swap[3], Call::Start(_)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drift_checks_pull_in_parallel() {
        let h = harness(COMPOSE, |_| {});
        drifted(&h);
        h.engine.add_image("worker:v1", "sha:w1");
        h.engine.publish_remote("worker:v1", "sha:w2");
        h.engine
            .add_container("c1", "api", "app:v1", &[("nocloud.update", "true")]);
        h.engine
            .add_container("c2", "worker", "worker:v1", &[("nocloud.update", "true")]);
        // Neither pull completes until both are in flight.
        h.engine.hold_pulls(Arc::new(tokio::sync::Barrier::new(2)));

        let mut tasks = tokio::task::JoinSet::new();
        for id in ["c1", "c2"] {
            let operator = Arc::clone(&h.operator);
            tasks.spawn(async move { operator.check_drift(id).await });
        }
        let joined = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let mut outcomes = Vec::new();
            while let Some(result) = tasks.join_next().await {
                outcomes.push(result.unwrap());
            }
            outcomes
        })
        .await
        .expect("drift checks serialized their pulls");

        assert_eq!(joined.len(), 2);
        assert!(joined
            .iter()
            .all(|r| matches!(r, Ok(DriftOutcome::Replaced(_)))));
    }
}
