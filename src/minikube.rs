//! minikube cluster lifecycle.
//!
//! Two modes: a dedicated profile in a VM, or `--vm-driver=none` running
//! directly on the host docker daemon (linux only, needs sudo). Starting an
//! already existing cluster and creating a new one are the same command, so
//! the profile check only decides which flags to pass.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::command_runner::CommandRunner;
use crate::config::{self, ChainConfig};
use crate::output::ProgressReporter;

/// Profile (and kube context) name for VM-backed clusters.
pub const MINIKUBE_PROFILE: &str = "minikube-dragonchain";

/// Kube context name minikube writes when running with `--vm-driver=none`.
const NATIVE_CONTEXT: &str = "minikube";

#[derive(Debug, Deserialize)]
struct ProfileList {
    #[serde(default)]
    valid: Vec<Profile>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(rename = "Name")]
    name: String,
}

fn profile_list_contains(stdout: &[u8], profile: &str) -> Result<bool> {
    let list: ProfileList =
        serde_json::from_slice(stdout).context("parsing minikube profile list")?;
    Ok(list.valid.iter().any(|p| p.name == profile))
}

async fn profile_exists(runner: &impl CommandRunner) -> Result<bool> {
    // minikube can fail unexpectedly when the profiles folder is missing:
    // https://github.com/kubernetes/minikube/issues/5898
    if let Some(home) = dirs::home_dir() {
        std::fs::create_dir_all(home.join(".minikube").join("profiles"))
            .context("creating minikube profiles folder")?;
    }
    let output = runner
        .run("minikube", &["profile", "list", "-o", "json"])
        .await
        .context("failed to run minikube profile list")?;
    anyhow::ensure!(
        output.status.success(),
        "couldn't get minikube profile list: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    profile_list_contains(&output.stdout, MINIKUBE_PROFILE)
}

/// Start (or create and start) the minikube cluster, returning the kube
/// context name the rest of the install should target.
///
/// The start command streams its own progress, so it runs with inherited
/// stdio and no timeout.
///
/// # Errors
///
/// Returns an error if the profile list cannot be read or minikube exits
/// non-zero.
pub async fn start_cluster(
    runner: &impl CommandRunner,
    settings: &ChainConfig,
    reporter: &impl ProgressReporter,
) -> Result<String> {
    let kubernetes_version = format!("--kubernetes-version={}", config::KUBERNETES_VERSION);

    if !settings.use_vm {
        reporter.step("starting minikube cluster; this can take a while...");
        let status = runner
            .run_status(
                "sudo",
                &["minikube", "start", &kubernetes_version, "--vm-driver=none"],
            )
            .await?;
        anyhow::ensure!(status.success(), "failed to start minikube");
        fix_native_config_ownership(runner).await?;
        return Ok(NATIVE_CONTEXT.to_owned());
    }

    let exists = profile_exists(runner).await?;
    let mut args = vec!["start", "-p", MINIKUBE_PROFILE, kubernetes_version.as_str()];
    let memory = format!("--memory={}", config::MINIKUBE_VM_MEMORY);
    let cpus = format!("--cpus={}", config::MINIKUBE_CPUS);
    if exists {
        reporter.step(&format!(
            "starting existing minikube cluster '{MINIKUBE_PROFILE}'; this can take a while..."
        ));
    } else {
        reporter.step(&format!(
            "starting new minikube cluster '{MINIKUBE_PROFILE}'; this can take a while..."
        ));
        args.extend([memory.as_str(), cpus.as_str()]);
    }
    let status = runner.run_status("minikube", &args).await?;
    anyhow::ensure!(status.success(), "failed to start minikube");
    Ok(MINIKUBE_PROFILE.to_owned())
}

/// With `--vm-driver=none` minikube runs as root and leaves root-owned files
/// in `~/.kube` and `~/.minikube`; chown them back to the invoking user.
async fn fix_native_config_ownership(runner: &impl CommandRunner) -> Result<()> {
    let uid = id_output(runner, "-u").await?;
    let gid = id_output(runner, "-g").await?;
    let home = dirs::home_dir().context("couldn't find home directory")?;
    let kube = home.join(".kube");
    let minikube = home.join(".minikube");
    let ownership = format!("{uid}:{gid}");
    let status = runner
        .run_status(
            "sudo",
            &[
                "chown",
                "-R",
                &ownership,
                &kube.to_string_lossy(),
                &minikube.to_string_lossy(),
            ],
        )
        .await?;
    anyhow::ensure!(status.success(), "was not able to chown config directories");
    Ok(())
}

async fn id_output(runner: &impl CommandRunner, flag: &str) -> Result<String> {
    let output = runner
        .run("id", &[flag])
        .await
        .context("failed to run id")?;
    anyhow::ensure!(
        output.status.success(),
        "couldn't get current user id: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Commands a user can run later to stop and start the installed chain.
#[must_use]
pub fn friendly_commands(use_vm: bool) -> (String, String) {
    if use_vm {
        (
            format!(
                "minikube start -p {MINIKUBE_PROFILE} --kubernetes-version={}",
                config::KUBERNETES_VERSION
            ),
            format!("minikube stop -p {MINIKUBE_PROFILE}"),
        )
    } else {
        (
            format!(
                "sudo minikube start --kubernetes-version={}",
                config::KUBERNETES_VERSION
            ),
            "sudo minikube stop".to_owned(),
        )
    }
}
