//! Deployment executor: runs one deployment script through the tool and folds
//! the artifacts it reports into the deployed state.

use std::{
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    sync::LazyLock,
};

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
    sync::Mutex,
};
use url::Url;

use crate::{DeployError, EnvBag, Network, error::Result, settings::ArtifactSource, state::DeployedState};

/// Extension of deployment scripts referenced by bare name.
pub const SCRIPT_EXTENSION: &str = ".s.sol";

const REDACTED: &str = "<redacted>";

static ARTIFACT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)^\s*([A-Za-z0-9_]+)=(0x[0-9a-fA-F]+|\d+)\b").expect("artifact pattern is valid")
});

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi pattern is valid")
});

/// Resolve a script reference to the path handed to the tool.
///
/// `Dahlia` becomes `<scripts_dir>/Dahlia.s.sol`. References that already end
/// in `.sol` or contain a `/` are used verbatim.
pub fn resolve_script_path(scripts_dir: &Path, reference: &str) -> PathBuf {
    if reference.ends_with(".sol") || reference.contains('/') {
        PathBuf::from(reference)
    } else {
        scripts_dir.join(format!("{reference}{SCRIPT_EXTENSION}"))
    }
}

/// Short script name used in logs, errors and log file names.
pub fn script_label(reference: &str) -> String {
    let file = reference.rsplit('/').next().unwrap_or(reference);
    file.trim_end_matches(".sol")
        .trim_end_matches(".s")
        .to_string()
}

/// Per-run log file path: `<logs_dir>/<command>-<script>-<unix_seconds>.log`.
pub fn log_file_path(logs_dir: &Path, command: &str, script: &str) -> PathBuf {
    let now = chrono::Utc::now().timestamp();
    logs_dir.join(format!("{command}-{}-{now}.log", script_label(script)))
}

/// Extract `NAME=VALUE` artifact lines from the tool's stdout.
///
/// Values are hex addresses (`0x...`) or ASCII decimal integers. Other lines are ignored.
pub fn parse_artifacts(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            ARTIFACT_LINE
                .captures(line)
                .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        })
        .collect()
}

fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

/// Output stream of the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Destination of tool output: console, a run log file, or memory.
///
/// File and memory copies have ANSI escape sequences stripped.
#[derive(Debug, Default)]
pub struct LogSink {
    echo: bool,
    file: Option<(PathBuf, Mutex<Option<tokio::fs::File>>)>,
    memory: Option<std::sync::Mutex<Vec<String>>>,
}

impl LogSink {
    /// Echo to the console only.
    pub fn console() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Echo to the console and mirror into a log file at `path`.
    ///
    /// The file and its directory are created on the first written line, so a
    /// run that fails before spawning anything leaves no log behind.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            echo: true,
            file: Some((path.into(), Mutex::new(None))),
            memory: None,
        }
    }

    /// Capture lines in memory without echoing.
    pub fn in_memory() -> Self {
        Self {
            memory: Some(std::sync::Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }

    /// Lines captured by an in-memory sink.
    pub fn captured(&self) -> Vec<String> {
        match &self.memory {
            Some(memory) => memory
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            None => Vec::new(),
        }
    }

    /// Record the command about to run. Secrets must already be redacted.
    pub async fn header(&self, command: &str) {
        self.write(&format!("=== RUNNING COMMAND: {command} ===")).await;
    }

    /// Record one line of tool output.
    pub async fn line(&self, stream: Stream, prefix: &str, line: &str) {
        if self.echo {
            match stream {
                Stream::Stdout => println!("[{prefix}] {line}"),
                Stream::Stderr => eprintln!("[{prefix}] {line}"),
            }
        }
        self.write(&format!("[{prefix}] {}", strip_ansi(line))).await;
    }

    async fn write(&self, line: &str) {
        if let Some((path, file)) = &self.file {
            let mut file = file.lock().await;
            let written = async {
                if file.is_none() {
                    *file = Some(open_log(path).await?);
                    tracing::info!(path = %path.display(), "Logging tool output to file");
                }
                if let Some(file) = file.as_mut() {
                    file.write_all(line.as_bytes()).await?;
                    file.write_all(b"\n").await?;
                    file.flush().await?;
                }
                Ok::<(), std::io::Error>(())
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write to log file");
            }
        }
        if let Some(memory) = &self.memory {
            memory
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(strip_ansi(line).into_owned());
        }
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await
}

/// One concrete invocation of the deployment tool.
#[derive(Clone, PartialEq, Eq)]
pub struct DeploymentTask {
    pub network: Network,
    /// Script reference as requested (name or path).
    pub script: String,
    /// Path handed to the tool, relative to its working directory.
    pub script_path: PathBuf,
    pub rpc_url: Url,
    pub private_key: String,
    /// Environment layered over the inherited process environment.
    pub env: EnvBag,
    /// Position inside an iterator field, if any.
    pub index: Option<usize>,
    /// Chain id reported by the readiness probe.
    pub chain_id: Option<u64>,
}

impl std::fmt::Debug for DeploymentTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentTask")
            .field("network", &self.network)
            .field("script", &self.script)
            .field("script_path", &self.script_path)
            .field("rpc_url", &self.rpc_url.as_str())
            .field("index", &self.index)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl DeploymentTask {
    /// Tool arguments: `script <path> --rpc-url <url> --broadcast --private-key <key>`.
    pub fn args(&self) -> Vec<String> {
        vec![
            "script".to_string(),
            self.script_path.display().to_string(),
            "--rpc-url".to_string(),
            self.rpc_url.as_str().trim_end_matches('/').to_string(),
            "--broadcast".to_string(),
            "--private-key".to_string(),
            self.private_key.clone(),
        ]
    }

    /// [`Self::args`] with the private key masked.
    pub fn redacted_args(&self) -> Vec<String> {
        let mut args = self.args();
        if let Some(key) = args.last_mut() {
            *key = REDACTED.to_string();
        }
        args
    }

    /// `Dahlia` or `WrappedVault[2]`.
    pub fn label(&self) -> String {
        let name = script_label(&self.script);
        match self.index {
            Some(index) => format!("{name}[{index}]"),
            None => name,
        }
    }
}

/// What the tool reported once it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub success: bool,
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
}

/// Runs a [`DeploymentTask`] to completion.
pub trait ScriptRunner: Send + Sync {
    fn run(
        &self,
        task: &DeploymentTask,
        sink: &LogSink,
    ) -> impl Future<Output = anyhow::Result<ScriptOutput>> + Send;
}

/// [`ScriptRunner`] spawning the deployment tool as a subprocess.
#[derive(Debug, Clone)]
pub struct ForgeRunner {
    pub tool: String,
    pub workdir: PathBuf,
}

impl ForgeRunner {
    pub fn new(tool: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            workdir: workdir.into(),
        }
    }
}

impl ScriptRunner for ForgeRunner {
    async fn run(&self, task: &DeploymentTask, sink: &LogSink) -> anyhow::Result<ScriptOutput> {
        let command = format!("{} {}", self.tool, task.redacted_args().join(" "));
        sink.header(&command).await;
        tracing::info!(
            network = %task.network,
            script = %task.label(),
            rpc_url = %task.rpc_url,
            "Deploying contracts"
        );

        let mut child = Command::new(&self.tool)
            .args(task.args())
            .current_dir(&self.workdir)
            .envs(task.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to start {} in {} (is it installed and in PATH?)",
                    self.tool,
                    self.workdir.display()
                )
            })?;

        let stdout = child.stdout.take().context("Tool stdout was not captured")?;
        let stderr = child.stderr.take().context("Tool stderr was not captured")?;
        let prefix = task.network.to_string();

        let (stdout, _, status) = tokio::try_join!(
            pump(stdout, Stream::Stdout, &prefix, sink),
            pump(stderr, Stream::Stderr, &prefix, sink),
            async {
                child
                    .wait()
                    .await
                    .with_context(|| format!("Failed to wait for {}", self.tool))
            },
        )?;

        Ok(ScriptOutput {
            success: status.success(),
            code: status.code(),
            stdout,
        })
    }
}

/// Tee a child stream into the sink line by line, returning what was read.
async fn pump<R>(reader: R, stream: Stream, prefix: &str, sink: &LogSink) -> anyhow::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read tool {stream:?}"))?
    {
        sink.line(stream, prefix, &line).await;
        captured.push_str(&line);
        captured.push('\n');
    }
    Ok(captured)
}

#[derive(Debug, Deserialize)]
struct BroadcastRun {
    #[serde(default)]
    transactions: Vec<BroadcastTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastTransaction {
    transaction_type: String,
    contract_name: Option<String>,
    contract_address: Option<String>,
}

/// Location of the tool's latest broadcast record for a script on a chain.
pub fn broadcast_path(workdir: &Path, script_path: &Path, chain_id: u64) -> Option<PathBuf> {
    let file = script_path.file_name()?;
    Some(
        workdir
            .join("broadcast")
            .join(file)
            .join(chain_id.to_string())
            .join("run-latest.json"),
    )
}

/// Contract creations recorded in a broadcast file, or `None` if it does not exist.
pub fn read_broadcast(path: &Path) -> anyhow::Result<Option<Vec<(String, String)>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read broadcast file {}", path.display()))?;
    let run: BroadcastRun = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse broadcast file {}", path.display()))?;

    Ok(Some(
        run.transactions
            .into_iter()
            .filter(|tx| tx.transaction_type.starts_with("CREATE"))
            .filter_map(|tx| Some((tx.contract_name?, tx.contract_address?)))
            .collect(),
    ))
}

/// Runs tasks through a [`ScriptRunner`] and records what they deploy.
#[derive(Debug)]
pub struct Executor<R> {
    runner: R,
    sink: LogSink,
    artifacts: ArtifactSource,
    workdir: PathBuf,
}

impl<R: ScriptRunner> Executor<R> {
    pub fn new(runner: R, sink: LogSink) -> Self {
        Self {
            runner,
            sink,
            artifacts: ArtifactSource::default(),
            workdir: PathBuf::from("."),
        }
    }

    /// Read artifacts from broadcast files under `workdir` instead of stdout.
    pub fn with_artifacts(mut self, artifacts: ArtifactSource, workdir: impl Into<PathBuf>) -> Self {
        self.artifacts = artifacts;
        self.workdir = workdir.into();
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Run `task` and record its artifacts under its network in `state`.
    ///
    /// Artifacts reported before a failure are kept. A non-zero exit becomes
    /// [`DeployError::Subprocess`]. Returns the recorded artifacts.
    pub async fn run(
        &self,
        task: &DeploymentTask,
        state: &Mutex<DeployedState>,
    ) -> Result<Vec<(String, String)>> {
        let broadcast = self.clear_broadcast(task);
        let output = self.runner.run(task, &self.sink).await?;
        let artifacts = self.collect_artifacts(task, &output, broadcast.as_deref());

        {
            let mut state = state.lock().await;
            for (name, value) in &artifacts {
                tracing::info!(network = %task.network, %name, %value, "Recorded deployed artifact");
                state.record(task.network, name.clone(), value.clone());
            }
        }

        if !output.success {
            tracing::error!(
                network = %task.network,
                script = %task.label(),
                code = ?output.code,
                "Deployment script failed"
            );
            return Err(DeployError::Subprocess {
                network: task.network,
                script: task.label(),
                code: output.code,
            });
        }

        Ok(artifacts)
    }

    /// Remove the broadcast record left by an earlier run so only this run's
    /// record is read back. Returns the path to read once the tool exited.
    fn clear_broadcast(&self, task: &DeploymentTask) -> Option<PathBuf> {
        if self.artifacts != ArtifactSource::Broadcast {
            return None;
        }
        let path = task
            .chain_id
            .and_then(|id| broadcast_path(&self.workdir, &task.script_path, id))?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed previous broadcast file");
                Some(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot remove previous broadcast file, reading stdout");
                None
            }
        }
    }

    fn collect_artifacts(
        &self,
        task: &DeploymentTask,
        output: &ScriptOutput,
        broadcast: Option<&Path>,
    ) -> Vec<(String, String)> {
        match broadcast {
            Some(path) if output.success => match read_broadcast(path) {
                Ok(Some(found)) => return found,
                Ok(None) => {
                    tracing::debug!(script = %task.label(), "No broadcast file, reading stdout");
                }
                Err(e) => {
                    tracing::warn!(script = %task.label(), error = %e, "Unreadable broadcast file, reading stdout");
                }
            },
            Some(_) => {
                tracing::debug!(script = %task.label(), "Failed run, reading stdout instead of the broadcast file");
            }
            None => {}
        }
        parse_artifacts(&output.stdout)
    }
}
