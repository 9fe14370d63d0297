//! Chain configuration: interactive prompting, validation, and persistence.
//!
//! A [`ChainConfig`] is built once (from a saved file or by prompting) and is
//! read-only for the rest of the run; every provisioning step receives it by
//! reference. The resolved kube context is threaded explicitly as well - there
//! is no process-wide "current cluster" variable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::output::OutputContext;
use crate::secrets;

/// Helm chart version for the chain deployment.
pub const DRAGONCHAIN_HELM_VERSION: &str = "1.0.9";
/// Helm chart version for OpenFaaS (faas-netes).
pub const OPENFAAS_HELM_VERSION: &str = "7.0.4";
/// Helm chart version for the docker container registry.
pub const REGISTRY_HELM_VERSION: &str = "1.9.1";
/// Fixed ClusterIP for the in-cluster docker registry.
pub const REGISTRY_IP: &str = "10.100.1.102";
/// Service port for the in-cluster docker registry.
pub const REGISTRY_PORT: u16 = 5000;
/// Kubernetes version used for the minikube cluster.
pub const KUBERNETES_VERSION: &str = "v1.15.10";
/// Memory given to the minikube VM when creating a new cluster.
pub const MINIKUBE_VM_MEMORY: &str = "4000mb";
/// CPUs given to the minikube VM when creating a new cluster.
pub const MINIKUBE_CPUS: u32 = 2;
/// Default chain port when the user leaves the prompt blank.
pub const DEFAULT_PORT: u16 = 30000;

const NAME_PATTERN: &str = "^[a-z][a-z0-9-_]{0,62}$";
const ENDPOINT_PATTERN: &str = r"^http(s)?://(((([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5]))|((([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])))$";

/// All of the data needed to configure a new chain. Field names in the saved
/// JSON match the historical installer config so old files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain level, 1-5.
    #[serde(rename = "Level")]
    pub level: u8,
    /// Chain name (lowercase, DNS-label-ish).
    #[serde(rename = "Name")]
    pub name: String,
    /// Publicly broadcast endpoint, including scheme and port.
    #[serde(rename = "EndpointURL")]
    pub endpoint_url: String,
    /// NodePort the chain webserver listens on.
    #[serde(rename = "Port")]
    pub port: u16,
    /// Chain ID from the Dragonchain console (or a random local one).
    /// This is the idempotence key for secrets and the helm release.
    #[serde(rename = "InternalID")]
    pub internal_id: String,
    /// Matchmaking token from the Dragonchain console.
    #[serde(rename = "RegistrationToken")]
    pub registration_token: String,
    /// Run minikube inside a VirtualBox VM rather than on native docker.
    #[serde(rename = "UseVM")]
    pub use_vm: bool,
    /// Create/start a local minikube cluster; when false, deploy to the
    /// current kube context instead.
    #[serde(rename = "InstallKubernetes")]
    pub install_kubernetes: bool,
    /// "dev" or "prod".
    #[serde(rename = "Stage")]
    pub stage: String,
}

/// Directory holding installer state (`~/.dragonchain`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.join(".dragonchain"))
}

fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("installation_config"))
}

/// Load a previously saved configuration, returning `None` if there is none.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_saved(path: &std::path::Path) -> Result<Option<ChainConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: ChainConfig = serde_json::from_str(&content)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(Some(config))
}

/// Persist the configuration for reuse by the next run.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn save(config: &ChainConfig, path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let content = serde_json::to_string(config).context("serializing config")?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

/// Validate a chain name against the allowed pattern.
///
/// # Errors
///
/// Returns an error describing the required pattern when the name is invalid.
pub fn validate_name(name: &str) -> Result<()> {
    let re = Regex::new(NAME_PATTERN).context("compiling name pattern")?;
    anyhow::ensure!(
        re.is_match(name),
        "provided name is not valid; must match {NAME_PATTERN}"
    );
    Ok(())
}

/// Validate a broadcast endpoint (scheme + DNS name or IPv4, no port).
///
/// # Errors
///
/// Returns an error when the endpoint does not look like `http(s)://host`.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let re = Regex::new(ENDPOINT_PATTERN).context("compiling endpoint pattern")?;
    anyhow::ensure!(
        re.is_match(endpoint),
        "provided endpoint is not valid; must look like http://a.b (dns name or ip)"
    );
    Ok(())
}

/// Parse a level answer into 1-5.
///
/// # Errors
///
/// Returns an error when the answer is not an integer in range.
pub fn parse_level(answer: &str) -> Result<u8> {
    let level: u8 = answer
        .trim()
        .parse()
        .context("couldn't parse provided level into an integer")?;
    anyhow::ensure!((1..=5).contains(&level), "level must be between 1 and 5");
    Ok(level)
}

/// Parse a port answer, defaulting to [`DEFAULT_PORT`] when blank.
///
/// # Errors
///
/// Returns an error when a non-blank answer is not a valid port number.
pub fn parse_port(answer: &str) -> Result<u16> {
    if answer.trim().is_empty() {
        return Ok(DEFAULT_PORT);
    }
    answer
        .trim()
        .parse()
        .context("couldn't parse provided port into an integer")
}

/// Append the chain port to an endpoint unless it is a well-known HTTP port.
#[must_use]
pub fn endpoint_with_port(endpoint: &str, port: u16) -> String {
    if port == 80 || port == 8080 {
        endpoint.to_owned()
    } else {
        format!("{endpoint}:{port}")
    }
}

/// Look up this machine's public IP for the default broadcast endpoint.
async fn public_ip() -> Result<String> {
    let body = reqwest::get("https://ifconfig.co/")
        .await
        .context("requesting public ip")?
        .text()
        .await
        .context("reading public ip response")?;
    Ok(body.trim_end_matches('\n').to_owned())
}

fn prompt_text(question: &str) -> Result<String> {
    let answer: String = dialoguer::Input::new()
        .with_prompt(question)
        .allow_empty(true)
        .interact_text()
        .context("reading input")?;
    Ok(answer.trim().to_owned())
}

fn prompt_yes_no(question: &str, default: bool) -> Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(question)
        .default(default)
        .interact()
        .context("reading input")
}

fn summarize(output: &OutputContext, config: &ChainConfig) {
    output.kv("Level", &config.level.to_string());
    output.kv("Name", &config.name);
    output.kv("EndpointURL", &config.endpoint_url);
    output.kv("Port", &config.port.to_string());
    output.kv("ChainID", &config.internal_id);
    output.kv("MatchmakingToken", &config.registration_token);
    output.kv("UseVM", &config.use_vm.to_string());
    output.kv("InstallKubernetes", &config.install_kubernetes.to_string());
    output.kv("Stage", &config.stage);
}

/// Prompt the user for every configurable value of a new chain.
///
/// # Errors
///
/// Returns an error on invalid input or failed public-IP lookup.
pub async fn prompt(output: &OutputContext) -> Result<ChainConfig> {
    let stage = if prompt_yes_no("Use the prod stage for this chain? (no = dev)", false)? {
        "prod".to_owned()
    } else {
        "dev".to_owned()
    };
    let install_kubernetes = prompt_yes_no(
        "Install and manage a local minikube cluster? (no = use the current kube context)",
        true,
    )?;
    let use_vm = if install_kubernetes {
        prompt_yes_no(
            "Run the cluster inside a VirtualBox VM? (no = use your machine's native docker)",
            true,
        )?
    } else {
        false
    };

    let level = parse_level(&prompt_text("What level chain would you like to create? [1-5]")?)?;
    let name = prompt_text("What name would you like for this chain?")?;
    validate_name(&name)?;

    let mut internal_id = prompt_text(
        "Input the Chain ID for this chain (from the Dragonchain console; leave empty for local-only)",
    )?;
    if internal_id.is_empty() {
        internal_id = secrets::random_token(16, secrets::LOWER_ALNUM_CHARS);
        output.info(&format!("Defaulting to randomly generated: {internal_id}"));
    }
    let mut registration_token = prompt_text(
        "Input the matchmaking token for this chain (from the Dragonchain console; leave empty for local-only)",
    )?;
    if registration_token.is_empty() {
        registration_token = secrets::random_token(16, secrets::LOWER_ALNUM_CHARS);
        output.info(&format!(
            "Defaulting to randomly generated: {registration_token}"
        ));
    }

    let port = parse_port(&prompt_text(
        "What port would you like to run the chain on? [30000-32767, blank for 30000]",
    )?)?;

    let mut endpoint = prompt_text(
        "What endpoint would you like to broadcast for this chain? (e.g. http://my.domain; blank to use your public ip)",
    )?;
    if endpoint.is_empty() {
        let ip = public_ip().await.context("issue getting public ip")?;
        output.info(&format!("Defaulting to endpoint with public ip {ip}"));
        endpoint = format!("http://{ip}");
    } else {
        validate_endpoint(&endpoint)?;
    }
    let endpoint_url = endpoint_with_port(&endpoint, port);

    Ok(ChainConfig {
        level,
        name,
        endpoint_url,
        port,
        internal_id,
        registration_token,
        use_vm,
        install_kubernetes,
        stage,
    })
}

/// Offer a previously saved configuration for reuse, otherwise prompt for a
/// new one and save it.
///
/// # Errors
///
/// Returns an error on unreadable saved config, invalid input, or a failed
/// write of the new config.
pub async fn load_or_prompt(output: &OutputContext) -> Result<ChainConfig> {
    let path = config_path()?;
    if let Some(existing) = load_saved(&path)? {
        output.header("Existing config found:");
        summarize(output, &existing);
        if prompt_yes_no("Would you like to use this config?", true)? {
            return Ok(existing);
        }
    }
    let config = prompt(output).await?;
    save(&config, &path)?;
    Ok(config)
}
