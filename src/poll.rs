//! Bounded readiness polling.
//!
//! Everything eventually-consistent goes through [`wait_until`]: a fixed
//! attempt cap, a fixed interval, and a check that either produces a value,
//! asks for another attempt, or fails hard. The cap counts status queries, so
//! `max_attempts` is exactly the number of times the check runs before the
//! poller gives up.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::PollError;
use crate::kubectl::{CHAIN_NAMESPACE, ClusterCli};

/// Interval between polling attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempt cap for chain pod readiness (~2 minutes).
pub const PODS_READY_ATTEMPTS: u32 = 120;

/// Attempt cap for the public-ID fetch (~1 minute).
pub const PUBLIC_ID_ATTEMPTS: u32 = 60;

/// Timeout hint appended to pod readiness failures.
const READY_HINT: &str = "check the Kubernetes cluster for more information";

/// Poll `check` until it yields a value or `max_attempts` queries have run.
///
/// `Ok(Some(v))` completes the poll, `Ok(None)` schedules another attempt
/// after `interval`, and `Err` aborts immediately without retrying. The sleep
/// only happens between attempts, never after the last one.
///
/// # Errors
///
/// [`PollError::TimedOut`] after `max_attempts` unsatisfied checks, or
/// [`PollError::Check`] the first time the check itself fails.
pub async fn wait_until<T, F, Fut>(
    max_attempts: u32,
    interval: Duration,
    hint: &'static str,
    mut check: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=max_attempts {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(PollError::TimedOut {
        attempts: max_attempts,
        hint,
    })
}

/// The slice of `kubectl get pod -o json` output the poller reads.
#[derive(Debug, Deserialize)]
pub struct PodList {
    pub items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
pub struct Pod {
    pub metadata: PodMetadata,
    pub status: PodStatus,
}

#[derive(Debug, Deserialize)]
pub struct PodMetadata {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(rename = "containerStatuses", default)]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ContainerStatus {
    pub ready: bool,
}

impl PodList {
    /// True when the list is non-empty and every pod is Running with all of
    /// its containers ready. An empty list means the pods have not been
    /// scheduled yet, not that there is nothing left to wait for.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        !self.items.is_empty()
            && self.items.iter().all(|pod| {
                pod.status.phase == "Running"
                    && !pod.status.container_statuses.is_empty()
                    && pod.status.container_statuses.iter().all(|c| c.ready)
            })
    }

    /// Name of the first pod in the Running phase with a ready container.
    #[must_use]
    pub fn first_running_ready(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|pod| {
                pod.status.phase == "Running"
                    && pod.status.container_statuses.iter().any(|c| c.ready)
            })
            .map(|pod| pod.metadata.name.as_str())
    }
}

async fn query_pods(cluster: &impl ClusterCli, namespace: &str, selector: &str) -> Result<PodList> {
    let output = cluster.get_pods_json(namespace, selector).await?;
    anyhow::ensure!(
        output.status.success(),
        "listing pods failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).context("parsing pod list")
}

/// Wait until every pod of the chain release reports all containers ready.
///
/// # Errors
///
/// Times out after [`PODS_READY_ATTEMPTS`] queries, or fails immediately if
/// the pod list cannot be fetched or parsed.
pub async fn wait_for_pods_ready(
    cluster: &impl ClusterCli,
    internal_id: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<(), PollError> {
    let selector = format!("dragonchainId={internal_id}");
    let selector = selector.as_str();
    wait_until(max_attempts, interval, READY_HINT, move || async move {
        let pods = query_pods(cluster, CHAIN_NAMESPACE, selector).await?;
        Ok(pods.all_ready().then_some(()))
    })
    .await
}

/// Wait for tiller to come up in kube-system (helm v2 only).
///
/// # Errors
///
/// Times out after `max_attempts` queries.
pub async fn wait_for_tiller_ready(
    cluster: &impl ClusterCli,
    max_attempts: u32,
    interval: Duration,
) -> Result<(), PollError> {
    wait_until(max_attempts, interval, READY_HINT, move || async move {
        let pods = query_pods(cluster, "kube-system", "name=tiller").await?;
        Ok(pods.all_ready().then_some(()))
    })
    .await
}

/// Fetch the chain's derived public ID by exec-ing into the webserver pod.
///
/// The public ID is derived from the signing key inside the chain image, so
/// the only way to read it is to ask a running webserver container. The pod
/// may restart a few times while the rest of the release settles, so each
/// attempt re-selects a currently ready pod.
///
/// # Errors
///
/// Times out after [`PUBLIC_ID_ATTEMPTS`] queries, or fails immediately on a
/// broken pod query or a failed exec.
pub async fn fetch_public_id(
    cluster: &impl ClusterCli,
    internal_id: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<String, PollError> {
    let selector = format!("app.kubernetes.io/component=webserver,dragonchainId={internal_id}");
    let selector = selector.as_str();
    wait_until(max_attempts, interval, READY_HINT, move || async move {
        let pods = query_pods(cluster, CHAIN_NAMESPACE, selector).await?;
        let Some(pod) = pods.first_running_ready() else {
            return Ok(None);
        };
        let output = cluster
            .exec_pod(
                CHAIN_NAMESPACE,
                pod,
                &[
                    "python3",
                    "-c",
                    "from dragonchain.lib.keys import get_public_id; print(get_public_id())",
                ],
            )
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "reading the public id from pod {pod} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let public_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok((!public_id.is_empty()).then_some(public_id))
    })
    .await
}
