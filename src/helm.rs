//! helm CLI abstraction plus helm bootstrap logic.
//!
//! Supports both helm v2 (tiller-based) and v3. The major version is detected
//! once from `helm version --short` and threaded through explicitly.

use std::process::Output;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::command_runner::{
    CommandRunner, DEFAULT_CMD_TIMEOUT, SLOW_CMD_TIMEOUT, TokioCommandRunner,
};
use crate::kubectl::ClusterCli;
use crate::output::ProgressReporter;
use crate::poll;

/// Chart repository for the chain charts.
pub const DRAGONCHAIN_REPO: (&str, &str) = ("dragonchain", "https://dragonchain-charts.s3.amazonaws.com");
/// Chart repository for OpenFaaS (faas-netes).
pub const OPENFAAS_REPO: (&str, &str) = ("openfaas", "https://openfaas.github.io/faas-netes/");
/// Stable chart repository; helm v3 no longer adds it by default.
pub const STABLE_REPO: (&str, &str) = ("stable", "https://kubernetes-charts.storage.googleapis.com");

/// Attempt cap for the tiller readiness wait (1s interval).
pub const TILLER_READY_ATTEMPTS: u32 = 60;

/// Parameters for `helm upgrade --install`.
pub struct UpgradeParams<'a> {
    /// Release name.
    pub release: &'a str,
    /// Chart reference, e.g. `dragonchain/dragonchain-k8s`.
    pub chart: &'a str,
    /// Target namespace.
    pub namespace: &'a str,
    /// `--set-string` values (forced string type), if any.
    pub set_string: Option<&'a str>,
    /// `--set` values.
    pub set: &'a str,
    /// Chart version to pin.
    pub version: &'a str,
}

/// Abstraction over the helm CLI.
#[allow(async_fn_in_trait)]
pub trait Helm {
    /// Run `helm version --short`.
    async fn short_version(&self) -> Result<Output>;

    /// Run `helm get notes <release>` (with `-n <namespace>` on helm v3).
    /// A non-zero exit means the release does not exist.
    async fn get_notes(&self, release: &str, namespace: Option<&str>) -> Result<Output>;

    /// Run `helm repo add <name> <url>`.
    async fn repo_add(&self, name: &str, url: &str) -> Result<Output>;

    /// Run `helm repo update`.
    async fn repo_update(&self) -> Result<Output>;

    /// Run `helm init --upgrade` (helm v2 only).
    async fn init_tiller(&self) -> Result<Output>;

    /// Run `helm upgrade --install` with the given parameters. Idempotent by
    /// helm's own semantics: installs when absent, upgrades in place when
    /// present.
    async fn upgrade_install(&self, params: &UpgradeParams<'_>) -> Result<Output>;
}

/// Production implementation - shells out to the `helm` binary, pinned to one
/// kube context.
pub struct HelmCli<R: CommandRunner> {
    runner: R,
    slow_runner: R,
    kube_context: String,
}

impl<R: CommandRunner> HelmCli<R> {
    /// Create a client with explicit runner instances (used in tests).
    pub fn new(runner: R, slow_runner: R, kube_context: &str) -> Self {
        Self {
            runner,
            slow_runner,
            kube_context: kube_context.to_owned(),
        }
    }
}

impl HelmCli<TokioCommandRunner> {
    /// Convenience constructor for production use with default timeouts.
    #[must_use]
    pub fn default_runner(kube_context: &str) -> Self {
        Self::new(
            TokioCommandRunner::new(DEFAULT_CMD_TIMEOUT),
            TokioCommandRunner::new(SLOW_CMD_TIMEOUT),
            kube_context,
        )
    }
}

impl<R: CommandRunner> Helm for HelmCli<R> {
    async fn short_version(&self) -> Result<Output> {
        self.runner
            .run("helm", &["version", "-c", "--short"])
            .await
            .context("failed to run helm version")
    }

    async fn get_notes(&self, release: &str, namespace: Option<&str>) -> Result<Output> {
        let mut args = vec!["get", "notes", release];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        args.extend(["--kube-context", self.kube_context.as_str()]);
        self.runner
            .run("helm", &args)
            .await
            .context("failed to run helm get notes")
    }

    async fn repo_add(&self, name: &str, url: &str) -> Result<Output> {
        self.runner
            .run("helm", &["repo", "add", name, url])
            .await
            .context("failed to run helm repo add")
    }

    async fn repo_update(&self) -> Result<Output> {
        self.slow_runner
            .run("helm", &["repo", "update"])
            .await
            .context("failed to run helm repo update")
    }

    async fn init_tiller(&self) -> Result<Output> {
        self.runner
            .run(
                "helm",
                &["init", "--upgrade", "--kube-context", &self.kube_context],
            )
            .await
            .context("failed to run helm init")
    }

    async fn upgrade_install(&self, params: &UpgradeParams<'_>) -> Result<Output> {
        let mut args = vec![
            "upgrade",
            "--install",
            params.release,
            params.chart,
            "--namespace",
            params.namespace,
        ];
        if let Some(set_string) = params.set_string {
            args.extend(["--set-string", set_string]);
        }
        args.extend([
            "--set",
            params.set,
            "--version",
            params.version,
            "--kube-context",
            self.kube_context.as_str(),
        ]);
        self.slow_runner
            .run("helm", &args)
            .await
            .context("failed to run helm upgrade --install")
    }
}

/// Detect the installed helm major version (2 or 3).
///
/// # Errors
///
/// Returns an error if helm cannot be run or the version string is
/// unrecognized.
pub async fn major_version(helm: &impl Helm) -> Result<u8> {
    let output = helm.short_version().await?;
    anyhow::ensure!(
        output.status.success(),
        "unable to get helm version: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let version = String::from_utf8_lossy(&output.stdout);
    if version.contains("v2.") {
        Ok(2)
    } else if version.contains("v3.") {
        Ok(3)
    } else {
        anyhow::bail!("unable to parse helm version string: {}", version.trim())
    }
}

/// Check whether a helm release already exists.
///
/// `helm get notes` exits non-zero when the release is absent, so any failure
/// here reads as "does not exist" rather than escalating. helm v2 has no
/// per-namespace release scoping, so the namespace flag is only passed on v3.
///
/// # Errors
///
/// Returns an error only if the helm process itself cannot be run.
pub async fn release_exists(
    helm: &impl Helm,
    helm_major: u8,
    release: &str,
    namespace: &str,
) -> Result<bool> {
    let namespace = (helm_major > 2).then_some(namespace);
    let output = helm.get_notes(release, namespace).await?;
    Ok(output.status.success() && !output.stdout.is_empty())
}

/// Initialize helm: tiller for v2, chart repositories for all versions.
///
/// # Errors
///
/// Returns an error if any repo cannot be added, the repo index cannot be
/// updated, or (on v2) tiller fails to initialize or become ready.
pub async fn initialize(
    helm: &impl Helm,
    cluster: &impl ClusterCli,
    reporter: &impl ProgressReporter,
) -> Result<u8> {
    reporter.step("configuring helm...");
    let helm_major = major_version(helm).await?;

    // Only helm v2 requires tiller initialization.
    if helm_major == 2 {
        let output = helm.init_tiller().await?;
        anyhow::ensure!(
            output.status.success(),
            "initializing helm failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let mut repos = vec![DRAGONCHAIN_REPO, OPENFAAS_REPO];
    if helm_major >= 3 {
        repos.push(STABLE_REPO);
    }
    for (name, url) in repos {
        let output = helm.repo_add(name, url).await?;
        anyhow::ensure!(
            output.status.success(),
            "adding {name} helm repo failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let output = helm.repo_update().await?;
    anyhow::ensure!(
        output.status.success(),
        "updating helm repos failed (are you connected to the internet?): {}",
        String::from_utf8_lossy(&output.stderr)
    );

    if helm_major == 2 {
        tokio::time::sleep(Duration::from_secs(3)).await;
        poll::wait_for_tiller_ready(cluster, TILLER_READY_ATTEMPTS, poll::POLL_INTERVAL)
            .await
            .context("tiller pod failed to become ready")?;
    }
    Ok(helm_major)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::test_support::{ScriptedHelm, err_output, ok_output};

    #[tokio::test]
    async fn major_version_parses_v2_and_v3() {
        let helm = ScriptedHelm::with_version(b"v3.1.0+gb29d20b\n");
        assert_eq!(major_version(&helm).await.expect("version"), 3);

        let helm = ScriptedHelm::with_version(b"Client: v2.16.1+gbbdfe5e\n");
        assert_eq!(major_version(&helm).await.expect("version"), 2);
    }

    #[tokio::test]
    async fn major_version_rejects_unknown_strings() {
        let helm = ScriptedHelm::with_version(b"v4.0.0\n");
        assert!(major_version(&helm).await.is_err());
    }

    #[tokio::test]
    async fn release_exists_reads_nonzero_exit_as_absent() {
        let mut helm = ScriptedHelm::with_version(b"v3.1.0\n");
        helm.notes = err_output(b"release: not found");
        assert!(!release_exists(&helm, 3, "openfaas", "openfaas").await.expect("query"));
    }

    #[tokio::test]
    async fn release_exists_requires_nonempty_notes() {
        let mut helm = ScriptedHelm::with_version(b"v3.1.0\n");
        helm.notes = ok_output(b"");
        assert!(!release_exists(&helm, 3, "openfaas", "openfaas").await.expect("query"));

        helm.notes = ok_output(b"NOTES: deployed");
        assert!(release_exists(&helm, 3, "openfaas", "openfaas").await.expect("query"));
    }

    #[tokio::test]
    async fn release_namespace_only_passed_on_v3() {
        let mut helm = ScriptedHelm::with_version(b"v3.1.0\n");
        helm.notes = ok_output(b"NOTES");
        release_exists(&helm, 2, "openfaas", "openfaas").await.expect("query");
        release_exists(&helm, 3, "openfaas", "openfaas").await.expect("query");
        let calls = helm.notes_calls();
        assert_eq!(calls, vec![None, Some("openfaas".to_owned())]);
    }
}
