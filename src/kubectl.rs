//! kubectl CLI abstraction - enables test doubles for all cluster operations.
//!
//! Every method targets one explicit kube context, passed in at construction.
//! Callers interpret exit status and stdout; methods only fail when the
//! process itself cannot be run.

use std::process::Output;

use anyhow::{Context, Result};

use crate::command_runner::{
    CommandRunner, DEFAULT_CMD_TIMEOUT, SLOW_CMD_TIMEOUT, TokioCommandRunner,
};

/// Namespace holding all chain resources.
pub const CHAIN_NAMESPACE: &str = "dragonchain";

/// Abstraction over the kubectl CLI.
#[allow(async_fn_in_trait)]
pub trait ClusterCli {
    /// Run `kubectl get <kind> <name> -n <namespace>`. A non-zero exit means
    /// the resource does not exist (the query fails only on absence).
    async fn get_resource(&self, kind: &str, namespace: &str, name: &str) -> Result<Output>;

    /// Run `kubectl get <kind> <name> -n <namespace> -o json`.
    async fn get_resource_json(&self, kind: &str, namespace: &str, name: &str) -> Result<Output>;

    /// Run `kubectl get pod -n <namespace> -l <selector> -o json`.
    async fn get_pods_json(&self, namespace: &str, selector: &str) -> Result<Output>;

    /// Run `kubectl create namespace <name>`.
    async fn create_namespace(&self, name: &str) -> Result<Output>;

    /// Run `kubectl create secret generic <name> -n <namespace>` with one
    /// `--from-literal=k=v` per entry.
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        literals: &[(&str, &str)],
    ) -> Result<Output>;

    /// Run `kubectl apply -f -` with the manifest piped to stdin.
    async fn apply_manifest(&self, manifest: &[u8]) -> Result<Output>;

    /// Run `kubectl apply -f <url>`.
    async fn apply_url(&self, url: &str) -> Result<Output>;

    /// Run `kubectl exec -n <namespace> <pod> -- <command>`.
    async fn exec_pod(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<Output>;
}

/// Production implementation - shells out to the `kubectl` binary through a
/// [`CommandRunner`], pinned to one kube context.
pub struct KubectlCli<R: CommandRunner> {
    runner: R,
    exec_runner: R,
    context_flag: String,
}

impl<R: CommandRunner> KubectlCli<R> {
    /// Create a client with explicit runner instances (used in tests).
    pub fn new(cmd_runner: R, exec_runner: R, kube_context: &str) -> Self {
        Self {
            runner: cmd_runner,
            exec_runner,
            context_flag: format!("--context={kube_context}"),
        }
    }
}

impl KubectlCli<TokioCommandRunner> {
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

/// Read the name of the currently selected kube context, for installs onto an
/// existing cluster.
///
/// # Errors
///
/// Returns an error if kubectl fails or reports no current context.
pub async fn current_context(runner: &impl CommandRunner) -> Result<String> {
    let output = runner
        .run("kubectl", &["config", "current-context"])
        .await
        .context("failed to run kubectl config current-context")?;
    anyhow::ensure!(
        output.status.success(),
        "no current kube context is configured: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

impl<R: CommandRunner> ClusterCli for KubectlCli<R> {
    async fn get_resource(&self, kind: &str, namespace: &str, name: &str) -> Result<Output> {
        self.runner
            .run(
                "kubectl",
                &["get", kind, name, "-n", namespace, &self.context_flag],
            )
            .await
            .context("failed to run kubectl get")
    }

    async fn get_resource_json(&self, kind: &str, namespace: &str, name: &str) -> Result<Output> {
        self.runner
            .run(
                "kubectl",
                &[
                    "get",
                    kind,
                    name,
                    "-n",
                    namespace,
                    "-o",
                    "json",
                    &self.context_flag,
                ],
            )
            .await
            .context("failed to run kubectl get -o json")
    }

    async fn get_pods_json(&self, namespace: &str, selector: &str) -> Result<Output> {
        self.runner
            .run(
                "kubectl",
                &[
                    "get",
                    "pod",
                    "-n",
                    namespace,
                    "-l",
                    selector,
                    "-o",
                    "json",
                    &self.context_flag,
                ],
            )
            .await
            .context("failed to run kubectl get pod")
    }

    async fn create_namespace(&self, name: &str) -> Result<Output> {
        self.runner
            .run(
                "kubectl",
                &["create", "namespace", name, &self.context_flag],
            )
            .await
            .context("failed to run kubectl create namespace")
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        literals: &[(&str, &str)],
    ) -> Result<Output> {
        let literal_args: Vec<String> = literals
            .iter()
            .map(|(k, v)| format!("--from-literal={k}={v}"))
            .collect();
        let mut args = vec!["create", "secret", "generic", name];
        args.extend(literal_args.iter().map(String::as_str));
        args.extend(["-n", namespace, self.context_flag.as_str()]);
        self.runner
            .run("kubectl", &args)
            .await
            .context("failed to run kubectl create secret")
    }

    async fn apply_manifest(&self, manifest: &[u8]) -> Result<Output> {
        self.runner
            .run_with_stdin(
                "kubectl",
                &["apply", &self.context_flag, "-f", "-"],
                manifest,
            )
            .await
            .context("failed to run kubectl apply")
    }

    async fn apply_url(&self, url: &str) -> Result<Output> {
        self.runner
            .run("kubectl", &["apply", &self.context_flag, "-f", url])
            .await
            .context("failed to run kubectl apply")
    }

    async fn exec_pod(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<Output> {
        let mut args = vec!["exec", "-n", namespace, pod, self.context_flag.as_str(), "--"];
        args.extend_from_slice(command);
        self.exec_runner
            .run("kubectl", &args)
            .await
            .context("failed to run kubectl exec")
    }
}
