//! Idempotent cluster provisioning.
//!
//! Every resource follows the same check-then-create discipline: query for
//! the resource, create it only when absent, and report which branch was
//! taken. Re-running an install therefore converges on the same cluster state
//! without duplicating resources or regenerating the chain's identity.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::command_runner::CommandRunner;
use crate::config::{self, ChainConfig};
use crate::helm::{self, Helm, UpgradeParams};
use crate::kubectl::{CHAIN_NAMESPACE, ClusterCli};
use crate::output::ProgressReporter;
use crate::poll;
use crate::secrets::{self, ALNUM_CHARS, ChainSecret};

/// Storage provisioner applied before anything else; the chain and registry
/// charts request `local-path` persistent volumes.
pub const LOCAL_PATH_PROVISIONER_URL: &str =
    "https://raw.githubusercontent.com/rancher/local-path-provisioner/master/deploy/local-path-storage.yaml";

/// Time to let containers settle after a docker daemon restart.
const DOCKER_RESTART_GRACE: Duration = Duration::from_secs(10);

const OPENFAAS_NAMESPACES_MANIFEST: &str = "\
apiVersion: v1
kind: Namespace
metadata:
  name: openfaas
  labels:
    role: openfaas-system
    access: openfaas-system
    istio-injection: enabled
---
apiVersion: v1
kind: Namespace
metadata:
  name: openfaas-fn
  labels:
    istio-injection: enabled
    role: openfaas-fn
";

const REGISTRY_NAMESPACE_MANIFEST: &str = "\
apiVersion: v1
kind: Namespace
metadata:
  name: registry
";

const BUILDER_SERVICE_ACCOUNT_MANIFEST: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: openfaas-builder
  namespace: dragonchain
automountServiceAccountToken: false
---
apiVersion: rbac.authorization.k8s.io/v1
kind: Role
metadata:
  namespace: dragonchain
  name: openfaas-builder
rules:
- apiGroups: [\"batch\"]
  resources: [\"jobs\", \"jobs/status\"]
  verbs: [\"create\", \"get\", \"delete\"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata:
  namespace: dragonchain
  name: openfaas-builder
subjects:
- kind: ServiceAccount
  name: openfaas-builder
  apiGroup: \"\"
roleRef:
  kind: Role
  name: openfaas-builder
  apiGroup: rbac.authorization.k8s.io
";

/// Which branch a check-then-create operation took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensure {
    /// The resource was absent and has been created.
    Created,
    /// The resource was already present and was left untouched.
    AlreadyExists,
}

async fn resource_exists(
    cluster: &impl ClusterCli,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    // kubectl get exits non-zero for a missing resource.
    let output = cluster.get_resource(kind, namespace, name).await?;
    Ok(output.status.success())
}

/// Apply the local-path storage provisioner manifest. `kubectl apply` is
/// already an upsert, so no existence check is needed.
///
/// # Errors
///
/// Returns an error if kubectl fails.
pub async fn apply_storage_provisioner(cluster: &impl ClusterCli) -> Result<()> {
    let output = cluster.apply_url(LOCAL_PATH_PROVISIONER_URL).await?;
    anyhow::ensure!(
        output.status.success(),
        "creating local path provisioner failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

/// Create the chain namespace if it does not already exist.
///
/// # Errors
///
/// Returns an error if the existence query or the create fails.
pub async fn ensure_namespace(cluster: &impl ClusterCli, name: &str) -> Result<Ensure> {
    if resource_exists(cluster, "namespace", name, name).await? {
        return Ok(Ensure::AlreadyExists);
    }
    let output = cluster.create_namespace(name).await?;
    anyhow::ensure!(
        output.status.success(),
        "creating {name} namespace failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(Ensure::Created)
}

/// Create the chain's identity secret, or decode the stored one.
///
/// The internal ID is the idempotence key: once a secret named
/// `d-<internal-id>-secrets` exists, its payload is reused verbatim so the
/// chain's signing key and HMAC credentials never change across re-runs.
///
/// # Errors
///
/// Returns an error if cluster queries fail or an existing payload cannot be
/// decoded.
pub async fn ensure_chain_secret(
    cluster: &impl ClusterCli,
    internal_id: &str,
    reporter: &impl ProgressReporter,
) -> Result<(ChainSecret, Ensure)> {
    let name = secrets::secret_name(internal_id);
    if resource_exists(cluster, "secret", CHAIN_NAMESPACE, &name).await? {
        reporter.step("existing secret for this chain id found, reusing...");
        let output = cluster
            .get_resource_json("secret", CHAIN_NAMESPACE, &name)
            .await?;
        anyhow::ensure!(
            output.status.success(),
            "retrieving existing chain secret failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let secret = ChainSecret::from_kubectl_json(&output.stdout)?;
        return Ok((secret, Ensure::AlreadyExists));
    }

    reporter.step("creating new secret for this chain id...");
    let secret = ChainSecret::generate();
    reporter.step(&format!(
        "root HMAC key details: ID: {} | KEY: {}",
        secret.hmac_id, secret.hmac_key
    ));
    let payload = secret.to_payload()?;
    let output = cluster
        .create_secret(CHAIN_NAMESPACE, &name, &[("SecretString", &payload)])
        .await?;
    anyhow::ensure!(
        output.status.success(),
        "adding secret for new chain failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok((secret, Ensure::Created))
}

async fn apply_manifest_checked(
    cluster: &impl ClusterCli,
    manifest: &str,
    what: &str,
) -> Result<()> {
    let output = cluster.apply_manifest(manifest.as_bytes()).await?;
    anyhow::ensure!(
        output.status.success(),
        "creating {what} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

async fn ensure_auth_secret(
    cluster: &impl ClusterCli,
    namespace: &str,
    name: &str,
    literals: &[(&str, &str)],
) -> Result<()> {
    if resource_exists(cluster, "secret", namespace, name).await? {
        return Ok(());
    }
    let output = cluster.create_secret(namespace, name, literals).await?;
    anyhow::ensure!(
        output.status.success(),
        "creating {name} secret failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

/// Install OpenFaaS if no `openfaas` helm release exists yet.
///
/// Creates the openfaas namespaces, a shared basic-auth password (stored once
/// for the gateway and once for the chain to read), then deploys the chart.
///
/// # Errors
///
/// Returns an error if any manifest, secret, or the helm deploy fails.
pub async fn ensure_openfaas(
    cluster: &impl ClusterCli,
    helm: &impl Helm,
    helm_major: u8,
) -> Result<Ensure> {
    if helm::release_exists(helm, helm_major, "openfaas", "openfaas").await? {
        return Ok(Ensure::AlreadyExists);
    }
    apply_manifest_checked(cluster, OPENFAAS_NAMESPACES_MANIFEST, "openfaas namespaces").await?;

    let password = secrets::random_token(40, ALNUM_CHARS);
    ensure_auth_secret(
        cluster,
        "openfaas",
        "basic-auth",
        &[
            ("basic-auth-user", "admin"),
            ("basic-auth-password", &password),
        ],
    )
    .await?;
    ensure_auth_secret(
        cluster,
        CHAIN_NAMESPACE,
        "openfaas-auth",
        &[("user", "admin"), ("password", &password)],
    )
    .await?;

    let output = helm
        .upgrade_install(&UpgradeParams {
            release: "openfaas",
            chart: "openfaas/openfaas",
            namespace: "openfaas",
            set_string: None,
            set: "basic_auth=true,generateBasicAuth=false,functionNamespace=openfaas-fn,\
                  async=false,exposeServices=false,alertmanager.create=false,\
                  prometheus.create=false",
            version: config::OPENFAAS_HELM_VERSION,
        })
        .await?;
    anyhow::ensure!(
        output.status.success(),
        "helm deploying openfaas failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(Ensure::Created)
}

/// Install the in-cluster docker registry if no `registry` release exists.
///
/// # Errors
///
/// Returns an error if the namespace manifest or the helm deploy fails.
pub async fn ensure_registry(
    cluster: &impl ClusterCli,
    helm: &impl Helm,
    helm_major: u8,
) -> Result<Ensure> {
    if helm::release_exists(helm, helm_major, "registry", "registry").await? {
        return Ok(Ensure::AlreadyExists);
    }
    apply_manifest_checked(cluster, REGISTRY_NAMESPACE_MANIFEST, "registry namespace").await?;

    let set = format!(
        "persistence.enabled=true,persistence.storageClass=local-path,\
         persistence.deleteEnabled=true,service.type=ClusterIP,\
         service.clusterIP={},service.port={}",
        config::REGISTRY_IP,
        config::REGISTRY_PORT
    );
    let output = helm
        .upgrade_install(&UpgradeParams {
            release: "registry",
            chart: "stable/docker-registry",
            namespace: "registry",
            set_string: None,
            set: &set,
            version: config::REGISTRY_HELM_VERSION,
        })
        .await?;
    anyhow::ensure!(
        output.status.success(),
        "helm deploying registry failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(Ensure::Created)
}

/// Create the RBAC-scoped service account the chain uses to build OpenFaaS
/// functions, if absent.
///
/// # Errors
///
/// Returns an error if the existence query or the apply fails.
pub async fn ensure_builder_service_account(cluster: &impl ClusterCli) -> Result<Ensure> {
    if resource_exists(cluster, "serviceaccount", CHAIN_NAMESPACE, "openfaas-builder").await? {
        return Ok(Ensure::AlreadyExists);
    }
    apply_manifest_checked(
        cluster,
        BUILDER_SERVICE_ACCOUNT_MANIFEST,
        "openfaas builder service account",
    )
    .await?;
    Ok(Ensure::Created)
}

/// Point the host docker daemon at the in-cluster registry as an insecure
/// registry, then restart it. Only needed with `--vm-driver=none`, where
/// function images are pushed through the host daemon.
///
/// # Errors
///
/// Returns an error if the daemon config cannot be written or docker fails to
/// restart.
pub async fn configure_insecure_registry(runner: &impl CommandRunner) -> Result<()> {
    // Keep a backup of any previous daemon config; ignore failure when there
    // is none.
    let _ = runner
        .run_status(
            "sudo",
            &["mv", "/etc/docker/daemon.json", "/etc/docker/daemon.json.bak"],
        )
        .await;

    let daemon_json = format!(
        r#"{{"insecure-registries":["{}:{}"]}}"#,
        config::REGISTRY_IP,
        config::REGISTRY_PORT
    );
    let output = runner
        .run_with_stdin(
            "sudo",
            &["tee", "/etc/docker/daemon.json"],
            daemon_json.as_bytes(),
        )
        .await?;
    anyhow::ensure!(
        output.status.success(),
        "setting insecure registry on docker daemon failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let status = runner
        .run_status("sudo", &["service", "docker", "restart"])
        .await?;
    anyhow::ensure!(status.success(), "restarting docker daemon failed");
    // Let restarted containers come back up before touching the cluster.
    tokio::time::sleep(DOCKER_RESTART_GRACE).await;
    Ok(())
}

/// Set up everything the chain chart depends on: storage provisioner, the
/// chain namespace, and for level 1 the OpenFaaS/registry stack.
///
/// # Errors
///
/// Returns an error on the first prerequisite that cannot be provisioned.
pub async fn setup_prereqs(
    cluster: &impl ClusterCli,
    helm: &impl Helm,
    runner: &impl CommandRunner,
    helm_major: u8,
    settings: &ChainConfig,
    reporter: &impl ProgressReporter,
) -> Result<()> {
    apply_storage_provisioner(cluster).await?;
    if ensure_namespace(cluster, CHAIN_NAMESPACE).await? == Ensure::Created {
        reporter.step("created dragonchain namespace");
    }
    if settings.level != 1 {
        return Ok(());
    }

    if ensure_openfaas(cluster, helm, helm_major).await? == Ensure::Created {
        reporter.step("openfaas was not installed, deployed it");
    }
    if !settings.use_vm {
        configure_insecure_registry(runner).await?;
    }
    if ensure_registry(cluster, helm, helm_major).await? == Ensure::Created {
        reporter.step("container registry was not installed, deployed it");
    }
    if ensure_builder_service_account(cluster).await? == Ensure::Created {
        reporter.step("created openfaas builder service account");
    }
    Ok(())
}

/// Build the `--set-string` and `--set` value lists for the chain chart.
#[must_use]
pub fn chain_set_values(settings: &ChainConfig) -> (String, String) {
    let mut set_string = format!("global.environment.LEVEL={}", settings.level);
    if settings.stage == "dev" {
        set_string.push_str(",global.environment.STAGE=dev");
    }

    let mut set = format!(
        "global.environment.DRAGONCHAIN_NAME={},\
         global.environment.REGISTRATION_TOKEN={},\
         global.environment.INTERNAL_ID={},\
         global.environment.DRAGONCHAIN_ENDPOINT={},\
         service.port={}",
        settings.name,
        settings.registration_token,
        settings.internal_id,
        settings.endpoint_url,
        settings.port
    );
    if settings.level == 1 {
        set.push_str(&format!(
            ",faas.gateway=http://gateway.openfaas:8080,faas.mountFaasSecret=true,\
             faas.registry={}:{}",
            config::REGISTRY_IP,
            config::REGISTRY_PORT
        ));
    }
    (set_string, set)
}

/// Install or upgrade the chain's helm release. helm's own upgrade semantics
/// make this the upsert half of the provisioner.
///
/// # Errors
///
/// Returns an error if helm fails.
pub async fn upsert_chain_release(helm: &impl Helm, settings: &ChainConfig) -> Result<()> {
    let (set_string, set) = chain_set_values(settings);
    let release = format!("d-{}", settings.internal_id);
    let output = helm
        .upgrade_install(&UpgradeParams {
            release: &release,
            chart: "dragonchain/dragonchain-k8s",
            namespace: CHAIN_NAMESPACE,
            set_string: Some(&set_string),
            set: &set,
            version: config::DRAGONCHAIN_HELM_VERSION,
        })
        .await?;
    anyhow::ensure!(
        output.status.success(),
        "installing chain helm chart failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

/// Install (or converge) the chain itself: identity secret, helm release,
/// then wait for every pod to report ready.
///
/// # Errors
///
/// Returns an error if provisioning fails or the release never becomes ready.
pub async fn install_chain(
    cluster: &impl ClusterCli,
    helm: &impl Helm,
    settings: &ChainConfig,
    reporter: &impl ProgressReporter,
) -> Result<ChainSecret> {
    let (secret, _) = ensure_chain_secret(cluster, &settings.internal_id, reporter).await?;
    upsert_chain_release(helm, settings).await?;
    reporter.step("chain deployment complete, waiting for pods to become ready...");
    poll::wait_for_pods_ready(
        cluster,
        &settings.internal_id,
        poll::PODS_READY_ATTEMPTS,
        poll::POLL_INTERVAL,
    )
    .await
    .context("chain pods failed to become ready")?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::installer::test_support::{
        FakeCluster, MockRunner, NoopReporterStub, ScriptedHelm, ok_output,
    };

    fn test_config(level: u8) -> ChainConfig {
        ChainConfig {
            level,
            name: "banana".to_owned(),
            endpoint_url: "http://1.2.3.4:30000".to_owned(),
            port: 30000,
            internal_id: "abc123".to_owned(),
            registration_token: "token123".to_owned(),
            use_vm: true,
            install_kubernetes: true,
            stage: "prod".to_owned(),
        }
    }

    #[tokio::test]
    async fn namespace_is_created_only_when_absent() {
        let cluster = FakeCluster::new();
        assert_eq!(
            ensure_namespace(&cluster, "dragonchain").await.expect("ensure"),
            Ensure::Created
        );
        assert_eq!(
            ensure_namespace(&cluster, "dragonchain").await.expect("ensure"),
            Ensure::AlreadyExists
        );
        assert_eq!(cluster.created_namespaces(), vec!["dragonchain"]);
    }

    #[tokio::test]
    async fn chain_secret_is_generated_once_and_reused() {
        let cluster = FakeCluster::new();
        let reporter = NoopReporterStub;
        let (first, branch) = ensure_chain_secret(&cluster, "abc123", &reporter)
            .await
            .expect("first ensure");
        assert_eq!(branch, Ensure::Created);

        let (second, branch) = ensure_chain_secret(&cluster, "abc123", &reporter)
            .await
            .expect("second ensure");
        assert_eq!(branch, Ensure::AlreadyExists);
        assert_eq!(first, second);
        assert_eq!(cluster.secret_creations("d-abc123-secrets"), 1);
    }

    #[tokio::test]
    async fn distinct_ids_get_distinct_secrets() {
        let cluster = FakeCluster::new();
        let reporter = NoopReporterStub;
        let (a, _) = ensure_chain_secret(&cluster, "aaa", &reporter).await.expect("a");
        let (b, _) = ensure_chain_secret(&cluster, "bbb", &reporter).await.expect("b");
        assert_ne!(a.private_key, b.private_key);
    }

    #[tokio::test]
    async fn openfaas_skipped_when_release_exists() {
        let cluster = FakeCluster::new();
        let mut helm = ScriptedHelm::with_version(b"v3.1.0\n");
        helm.notes = ok_output(b"NOTES: deployed");
        assert_eq!(
            ensure_openfaas(&cluster, &helm, 3).await.expect("ensure"),
            Ensure::AlreadyExists
        );
        assert!(helm.upgrade_calls().is_empty());
    }

    #[tokio::test]
    async fn prereqs_above_level_one_stop_at_the_namespace() {
        let cluster = FakeCluster::new();
        let helm = ScriptedHelm::with_version(b"v3.1.0\n");
        let runner = MockRunner::new();
        setup_prereqs(&cluster, &helm, &runner, 3, &test_config(2), &NoopReporterStub)
            .await
            .expect("prereqs");
        assert_eq!(cluster.applied_urls(), vec![LOCAL_PATH_PROVISIONER_URL]);
        assert_eq!(cluster.created_namespaces(), vec!["dragonchain"]);
        assert!(helm.upgrade_calls().is_empty());
        assert!(cluster.applied_manifests().is_empty());
    }

    #[tokio::test]
    async fn level_one_prereqs_deploy_the_faas_stack() {
        let cluster = FakeCluster::new();
        let helm = ScriptedHelm::with_version(b"v3.1.0\n");
        let runner = MockRunner::new();
        setup_prereqs(&cluster, &helm, &runner, 3, &test_config(1), &NoopReporterStub)
            .await
            .expect("prereqs");
        assert_eq!(helm.upgrade_calls(), vec!["openfaas", "registry"]);
        // openfaas namespaces, registry namespace, builder service account
        assert_eq!(cluster.applied_manifests().len(), 3);
        // use_vm is set, so the host docker daemon is never touched
        assert!(runner.programs_run().is_empty());
    }

    #[test]
    fn set_values_for_level_two_prod() {
        let (set_string, set) = chain_set_values(&test_config(2));
        assert_eq!(set_string, "global.environment.LEVEL=2");
        assert!(set.contains("global.environment.DRAGONCHAIN_NAME=banana"));
        assert!(set.contains("global.environment.INTERNAL_ID=abc123"));
        assert!(set.contains("service.port=30000"));
        assert!(!set.contains("faas.gateway"));
    }

    #[test]
    fn set_values_for_level_one_dev() {
        let mut settings = test_config(1);
        settings.stage = "dev".to_owned();
        let (set_string, set) = chain_set_values(&settings);
        assert!(set_string.ends_with(",global.environment.STAGE=dev"));
        assert!(set.contains("faas.gateway=http://gateway.openfaas:8080"));
        assert!(set.contains(&format!(
            "faas.registry={}:{}",
            config::REGISTRY_IP,
            config::REGISTRY_PORT
        )));
    }

    #[tokio::test]
    async fn install_chain_converges_on_rerun() {
        let cluster = FakeCluster::new();
        cluster.push_ready_pods("web");
        cluster.push_ready_pods("web");
        let helm = ScriptedHelm::with_version(b"v3.1.0\n");
        let reporter = NoopReporterStub;
        let settings = test_config(2);

        let first = install_chain_fast(&cluster, &helm, &settings, &reporter)
            .await
            .expect("first install");
        let second = install_chain_fast(&cluster, &helm, &settings, &reporter)
            .await
            .expect("second install");
        assert_eq!(first, second);
        assert_eq!(cluster.secret_creations("d-abc123-secrets"), 1);
        assert_eq!(helm.upgrade_calls(), vec!["d-abc123", "d-abc123"]);
    }

    // Same flow as install_chain but with a zero poll interval.
    async fn install_chain_fast(
        cluster: &FakeCluster,
        helm: &ScriptedHelm,
        settings: &ChainConfig,
        reporter: &NoopReporterStub,
    ) -> anyhow::Result<crate::secrets::ChainSecret> {
        let (secret, _) = ensure_chain_secret(cluster, &settings.internal_id, reporter).await?;
        upsert_chain_release(helm, settings).await?;
        crate::poll::wait_for_pods_ready(cluster, &settings.internal_id, 3, Duration::ZERO)
            .await?;
        Ok(secret)
    }
}
