//! The install pipeline: wires the ports together and drives a full install
//! from prompt to Dragon Net verification.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::command_runner::{CommandRunner, DEFAULT_CMD_TIMEOUT, TokioCommandRunner};
use crate::config;
use crate::dragonnet::{self, HttpMatchmaking, Matchmaking};
use crate::error::VerifyError;
use crate::helm::{self, HelmCli};
use crate::kubectl::{self, KubectlCli};
use crate::minikube;
use crate::output::{ConsoleReporter, OutputContext, ProgressReporter};
use crate::poll;
use crate::provision;
use crate::upnp::{IgdPortMapper, PortMapper};

async fn check_tool(runner: &impl CommandRunner, program: &str, args: &[&str]) -> Result<()> {
    // Only spawn failures matter here; a non-zero exit still proves the
    // binary is on PATH.
    runner.run(program, args).await.map(|_| ()).map_err(|_| {
        anyhow::anyhow!("{program} does not appear to be installed (is it on your PATH?)")
    })
}

/// Verify that the CLI tools the install shells out to are present.
///
/// # Errors
///
/// Returns an actionable error naming the first missing tool.
pub async fn preflight(runner: &impl CommandRunner, needs_minikube: bool) -> Result<()> {
    check_tool(runner, "kubectl", &["version", "--client"]).await?;
    check_tool(runner, "helm", &["version", "-c", "--short"]).await?;
    if needs_minikube {
        check_tool(runner, "minikube", &["version"]).await?;
    }
    Ok(())
}

/// Verify the chain against Dragon Net, remediating an unreachable chain
/// with one UPnP port-forward attempt.
///
/// The remediation runs at most once, and only for
/// [`VerifyError::Unreachable`]; afterwards only the reachability phase is
/// re-checked (the registration phase already passed). When the port mapping
/// itself fails, the original unreachability detail is surfaced, annotated
/// with the mapping failure.
///
/// # Errors
///
/// Returns the final [`VerifyError`] when the chain still cannot be verified.
pub async fn verify_with_remediation(
    api: &impl Matchmaking,
    mapper: &impl PortMapper,
    public_id: &str,
    port: u16,
    interval: Duration,
    reporter: &impl ProgressReporter,
) -> Result<(), VerifyError> {
    match dragonnet::verify(api, public_id, interval).await {
        Err(VerifyError::Unreachable { detail }) => {
            reporter.step(
                "chain is registered but does not seem reachable, trying to port-forward with UPnP...",
            );
            match mapper.map_port(port).await {
                Ok(()) => {
                    reporter.step("UPnP port forward succeeded, checking reachability again...");
                    dragonnet::verify_reachability(api, public_id).await
                }
                Err(e) => Err(VerifyError::Unreachable {
                    detail: format!("{detail} (UPnP port forward also failed: {e:#})"),
                }),
            }
        }
        other => other,
    }
}

/// Run a complete install.
///
/// # Errors
///
/// Returns an error describing the first step that failed.
pub async fn run(output: &OutputContext) -> Result<()> {
    output.header("Dragonchain installer");
    let settings = config::load_or_prompt(output).await?;
    let reporter = ConsoleReporter::new(output);
    let runner = TokioCommandRunner::new(DEFAULT_CMD_TIMEOUT);

    preflight(&runner, settings.install_kubernetes).await?;

    let kube_context = if settings.install_kubernetes {
        minikube::start_cluster(&runner, &settings, &reporter).await?
    } else {
        let context = kubectl::current_context(&runner).await?;
        output.info(&format!("deploying to current kube context '{context}'"));
        context
    };

    let cluster = KubectlCli::default_runner(&kube_context);
    let helm = HelmCli::default_runner(&kube_context);
    let helm_major = helm::initialize(&helm, &cluster, &reporter).await?;
    provision::setup_prereqs(&cluster, &helm, &runner, helm_major, &settings, &reporter).await?;

    output.info("configuration of dependencies complete, now installing the chain");
    provision::install_chain(&cluster, &helm, &settings, &reporter).await?;
    output.success("chain installation complete");

    let pb = output
        .show_progress()
        .then(|| crate::output::progress::spinner("getting public id..."));
    if pb.is_none() {
        reporter.step("getting public id...");
    }
    let fetched = poll::fetch_public_id(
        &cluster,
        &settings.internal_id,
        poll::PUBLIC_ID_ATTEMPTS,
        poll::POLL_INTERVAL,
    )
    .await;
    if let Some(pb) = pb {
        match &fetched {
            Ok(_) => crate::output::progress::finish_ok(&pb, "public id retrieved."),
            Err(_) => crate::output::progress::finish_error(&pb, "getting public id failed."),
        }
    }
    let public_id = fetched.context("waiting for a running webserver pod")?;
    output.kv("Public ID", &public_id);

    if settings.install_kubernetes {
        let (start, stop) = minikube::friendly_commands(settings.use_vm);
        output.info(&format!("to stop the chain later, run: {stop}"));
        output.info(&format!("to restart the chain later, run: {start}"));
    }

    output.info("checking Dragon Net for proper chain configuration...");
    verify_with_remediation(
        &HttpMatchmaking::new(),
        &IgdPortMapper,
        &public_id,
        settings.port,
        poll::POLL_INTERVAL,
        &reporter,
    )
    .await
    .context("chain is installed and may be working locally, but Dragon Net configuration is invalid")?;

    output.success("chain is installed, running, and operating correctly with Dragon Net!");
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    //! Hand-rolled test doubles shared by the unit tests.

    use std::collections::{HashMap, HashSet, VecDeque};
    use std::os::unix::process::ExitStatusExt as _;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;

    use anyhow::Result;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;

    use crate::command_runner::CommandRunner;
    use crate::dragonnet::Matchmaking;
    use crate::helm::{Helm, UpgradeParams};
    use crate::kubectl::ClusterCli;
    use crate::output::ProgressReporter;
    use crate::upnp::PortMapper;

    pub fn ok_output(stdout: &[u8]) -> Output {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn err_output(stderr: &[u8]) -> Output {
        Output {
            status: ExitStatus::from_raw(1 << 8),
            stdout: Vec::new(),
            stderr: stderr.to_vec(),
        }
    }

    pub struct NoopReporterStub;

    impl ProgressReporter for NoopReporterStub {
        fn step(&self, _msg: &str) {}
    }

    /// Helm double returning canned outputs and recording calls.
    pub struct ScriptedHelm {
        pub version: Output,
        pub notes: Output,
        notes_calls: Mutex<Vec<Option<String>>>,
        upgrades: Mutex<Vec<String>>,
    }

    impl ScriptedHelm {
        pub fn with_version(stdout: &[u8]) -> Self {
            Self {
                version: ok_output(stdout),
                notes: err_output(b"release: not found"),
                notes_calls: Mutex::new(Vec::new()),
                upgrades: Mutex::new(Vec::new()),
            }
        }

        pub fn notes_calls(&self) -> Vec<Option<String>> {
            self.notes_calls.lock().expect("lock").clone()
        }

        pub fn upgrade_calls(&self) -> Vec<String> {
            self.upgrades.lock().expect("lock").clone()
        }
    }

    impl Helm for ScriptedHelm {
        async fn short_version(&self) -> Result<Output> {
            Ok(self.version.clone())
        }

        async fn get_notes(&self, _release: &str, namespace: Option<&str>) -> Result<Output> {
            self.notes_calls
                .lock()
                .expect("lock")
                .push(namespace.map(str::to_owned));
            Ok(self.notes.clone())
        }

        async fn repo_add(&self, _name: &str, _url: &str) -> Result<Output> {
            Ok(ok_output(b""))
        }

        async fn repo_update(&self) -> Result<Output> {
            Ok(ok_output(b""))
        }

        async fn init_tiller(&self) -> Result<Output> {
            Ok(ok_output(b""))
        }

        async fn upgrade_install(&self, params: &UpgradeParams<'_>) -> Result<Output> {
            self.upgrades
                .lock()
                .expect("lock")
                .push(params.release.to_owned());
            Ok(ok_output(b""))
        }
    }

    /// Stateful cluster double: resources created through it exist for later
    /// queries, so check-then-create logic can be exercised end to end.
    #[derive(Default)]
    pub struct FakeCluster {
        resources: Mutex<HashSet<(String, String, String)>>,
        secret_values: Mutex<HashMap<(String, String), String>>,
        secret_creates: Mutex<Vec<String>>,
        namespaces: Mutex<Vec<String>>,
        manifests: Mutex<Vec<String>>,
        urls: Mutex<Vec<String>>,
        pods: Mutex<VecDeque<Output>>,
        execs: Mutex<VecDeque<Output>>,
    }

    impl FakeCluster {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a pod list response with one running, ready pod.
        pub fn push_ready_pods(&self, name: &str) {
            let json = format!(
                r#"{{"items":[{{"metadata":{{"name":"{name}"}},"status":{{"phase":"Running","containerStatuses":[{{"ready":true}}]}}}}]}}"#
            );
            self.pods
                .lock()
                .expect("lock")
                .push_back(ok_output(json.as_bytes()));
        }

        pub fn push_pods_response(&self, output: Output) {
            self.pods.lock().expect("lock").push_back(output);
        }

        pub fn push_exec_response(&self, output: Output) {
            self.execs.lock().expect("lock").push_back(output);
        }

        pub fn created_namespaces(&self) -> Vec<String> {
            self.namespaces.lock().expect("lock").clone()
        }

        pub fn applied_urls(&self) -> Vec<String> {
            self.urls.lock().expect("lock").clone()
        }

        pub fn applied_manifests(&self) -> Vec<String> {
            self.manifests.lock().expect("lock").clone()
        }

        /// How many times a secret with this name was created.
        pub fn secret_creations(&self, name: &str) -> usize {
            self.secret_creates
                .lock()
                .expect("lock")
                .iter()
                .filter(|n| *n == name)
                .count()
        }
    }

    impl ClusterCli for FakeCluster {
        async fn get_resource(&self, kind: &str, namespace: &str, name: &str) -> Result<Output> {
            let key = (kind.to_owned(), namespace.to_owned(), name.to_owned());
            if self.resources.lock().expect("lock").contains(&key) {
                Ok(ok_output(b""))
            } else {
                Ok(err_output(b"NotFound"))
            }
        }

        async fn get_resource_json(
            &self,
            kind: &str,
            namespace: &str,
            name: &str,
        ) -> Result<Output> {
            if kind == "secret" {
                let key = (namespace.to_owned(), name.to_owned());
                if let Some(value) = self.secret_values.lock().expect("lock").get(&key) {
                    let envelope = format!(
                        r#"{{"data":{{"SecretString":"{}"}}}}"#,
                        BASE64.encode(value)
                    );
                    return Ok(ok_output(envelope.as_bytes()));
                }
            }
            Ok(err_output(b"NotFound"))
        }

        async fn get_pods_json(&self, _namespace: &str, _selector: &str) -> Result<Output> {
            Ok(self
                .pods
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| ok_output(br#"{"items":[]}"#)))
        }

        async fn create_namespace(&self, name: &str) -> Result<Output> {
            self.resources.lock().expect("lock").insert((
                "namespace".to_owned(),
                name.to_owned(),
                name.to_owned(),
            ));
            self.namespaces.lock().expect("lock").push(name.to_owned());
            Ok(ok_output(b""))
        }

        async fn create_secret(
            &self,
            namespace: &str,
            name: &str,
            literals: &[(&str, &str)],
        ) -> Result<Output> {
            self.resources.lock().expect("lock").insert((
                "secret".to_owned(),
                namespace.to_owned(),
                name.to_owned(),
            ));
            if let Some((_, value)) = literals.iter().find(|(k, _)| *k == "SecretString") {
                self.secret_values
                    .lock()
                    .expect("lock")
                    .insert((namespace.to_owned(), name.to_owned()), (*value).to_owned());
            }
            self.secret_creates.lock().expect("lock").push(name.to_owned());
            Ok(ok_output(b""))
        }

        async fn apply_manifest(&self, manifest: &[u8]) -> Result<Output> {
            self.manifests
                .lock()
                .expect("lock")
                .push(String::from_utf8_lossy(manifest).into_owned());
            Ok(ok_output(b""))
        }

        async fn apply_url(&self, url: &str) -> Result<Output> {
            self.urls.lock().expect("lock").push(url.to_owned());
            Ok(ok_output(b""))
        }

        async fn exec_pod(&self, _namespace: &str, _pod: &str, _command: &[&str]) -> Result<Output> {
            Ok(self
                .execs
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| ok_output(b"")))
        }
    }

    /// Process runner double: every command succeeds with empty output,
    /// except programs named in `fail_for`, which fail to spawn.
    #[derive(Default)]
    pub struct MockRunner {
        pub fail_for: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_for(program: &str) -> Self {
            Self {
                fail_for: Some(program.to_owned()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn programs_run(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }

        fn record(&self, program: &str) -> Result<()> {
            self.calls.lock().expect("lock").push(program.to_owned());
            if self.fail_for.as_deref() == Some(program) {
                anyhow::bail!("failed to spawn {program}");
            }
            Ok(())
        }
    }

    impl CommandRunner for MockRunner {
        async fn run(&self, program: &str, _args: &[&str]) -> Result<Output> {
            self.record(program)?;
            Ok(ok_output(b""))
        }

        async fn run_with_timeout(
            &self,
            program: &str,
            _args: &[&str],
            _timeout: std::time::Duration,
        ) -> Result<Output> {
            self.record(program)?;
            Ok(ok_output(b""))
        }

        async fn run_with_stdin(
            &self,
            program: &str,
            _args: &[&str],
            _input: &[u8],
        ) -> Result<Output> {
            self.record(program)?;
            Ok(ok_output(b""))
        }

        async fn run_status(&self, program: &str, _args: &[&str]) -> Result<ExitStatus> {
            self.record(program)?;
            Ok(ExitStatus::from_raw(0))
        }
    }

    /// Matchmaking double fed from queues of canned responses.
    pub struct MockMatchmaking {
        registration: Mutex<VecDeque<u16>>,
        reachability: Mutex<VecDeque<(u16, String)>>,
        reg_queries: Mutex<usize>,
        reach_queries: Mutex<usize>,
        failing: bool,
    }

    impl MockMatchmaking {
        pub fn new(registration: Vec<u16>, reachability: Vec<(u16, String)>) -> Self {
            Self {
                registration: Mutex::new(registration.into()),
                reachability: Mutex::new(reachability.into()),
                reg_queries: Mutex::new(0),
                reach_queries: Mutex::new(0),
                failing: false,
            }
        }

        pub fn failing() -> Self {
            let mut api = Self::new(Vec::new(), Vec::new());
            api.failing = true;
            api
        }

        pub fn registration_queries(&self) -> usize {
            *self.reg_queries.lock().expect("lock")
        }

        pub fn reachability_queries(&self) -> usize {
            *self.reach_queries.lock().expect("lock")
        }
    }

    impl Matchmaking for MockMatchmaking {
        async fn registration_status(&self, _public_id: &str) -> Result<u16> {
            *self.reg_queries.lock().expect("lock") += 1;
            if self.failing {
                anyhow::bail!("connection refused");
            }
            self.registration
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("mock ran out of registration responses"))
        }

        async fn reachability(&self, _public_id: &str) -> Result<(u16, String)> {
            *self.reach_queries.lock().expect("lock") += 1;
            if self.failing {
                anyhow::bail!("connection refused");
            }
            self.reachability
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("mock ran out of reachability responses"))
        }
    }

    /// Port mapper double recording requested ports.
    pub struct MockPortMapper {
        pub fail: bool,
        calls: Mutex<Vec<u16>>,
    }

    impl MockPortMapper {
        pub fn succeeding() -> Self {
            Self {
                fail: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn mapped_ports(&self) -> Vec<u16> {
            self.calls.lock().expect("lock").clone()
        }
    }

    impl PortMapper for MockPortMapper {
        async fn map_port(&self, port: u16) -> Result<()> {
            self.calls.lock().expect("lock").push(port);
            if self.fail {
                anyhow::bail!("no UPnP compatible router found");
            }
            Ok(())
        }
    }
}
