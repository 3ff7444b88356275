use orkestra_core::{OrkestraError, OrkestraResult};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the sandbox runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container runtime executable (default: "docker").
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,

    /// Tag of the sandbox image, built on first use (default: "orkestra-sandbox:latest").
    #[serde(default = "default_image")]
    pub image: String,

    /// Base image the sandbox image is built from (default: "alpine:3.20").
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Memory limit in megabytes (default: 512).
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    /// CPU core limit (default: 1.0).
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Maximum number of processes inside the container (default: 64).
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    /// Hard timeout in seconds (default: 60).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Size of the writable `/tmp` tmpfs in megabytes (default: 64).
    #[serde(default = "default_tmpfs_size_mb")]
    pub tmpfs_size_mb: u64,

    /// Non-root `uid:gid` the script runs as (default: "10001:10001").
    #[serde(default = "default_user")]
    pub user: String,

    /// Cap on captured stdout / stderr, each (default: 64 KiB).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Run without containment when the runtime is unavailable (default: true).
    #[serde(default = "default_allow_dry_run")]
    pub allow_dry_run: bool,

    /// Host directory for per-run task files (default: `$TMPDIR/orkestra-sandbox`).
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "orkestra-sandbox:latest".to_string()
}

fn default_base_image() -> String {
    "alpine:3.20".to_string()
}

fn default_memory_limit_mb() -> u64 {
    512
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_pids_limit() -> u32 {
    64
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_tmpfs_size_mb() -> u64 {
    64
}

fn default_user() -> String {
    "10001:10001".to_string()
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_allow_dry_run() -> bool {
    true
}

fn default_work_root() -> PathBuf {
    std::env::temp_dir().join("orkestra-sandbox")
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_binary: default_runtime_binary(),
            image: default_image(),
            base_image: default_base_image(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
            timeout_secs: default_timeout_secs(),
            tmpfs_size_mb: default_tmpfs_size_mb(),
            user: default_user(),
            max_output_bytes: default_max_output_bytes(),
            allow_dry_run: default_allow_dry_run(),
            work_root: default_work_root(),
        }
    }
}

impl SandboxConfig {
    /// Dockerfile for the sandbox image: base image plus an unprivileged user.
    pub fn dockerfile(&self) -> String {
        let (uid, gid) = self.user.split_once(':').unwrap_or((&self.user, &self.user));
        format!(
            "FROM {base}\n\
             RUN addgroup -g {gid} sandbox && adduser -D -u {uid} -G sandbox sandbox\n\
             USER {uid}:{gid}\n\
             WORKDIR /tmp\n",
            base = self.base_image,
        )
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A script to run for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub task_id: String,
    /// Shell script, mounted read-only at `/task/script.sh`.
    pub script: String,
    /// Task input, mounted read-only at `/task/input.json`.
    pub input: serde_json::Value,
}

/// How a run was actually carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Ran inside a container.
    Contained,
    /// Not run: the runtime was unavailable and dry runs are allowed.
    DryRun,
}

/// Result of a sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub mode: SandboxMode,
}

impl SandboxResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

// ---------------------------------------------------------------------------
// Validation and argument building
// ---------------------------------------------------------------------------

/// Reject scripts that are empty or contain NUL bytes.
pub fn validate_script(script: &str) -> OrkestraResult<()> {
    if script.trim().is_empty() {
        return Err(OrkestraError::Sandbox("empty script rejected".to_string()));
    }
    if script.contains('\0') {
        return Err(OrkestraError::Sandbox(
            "script contains null bytes".to_string(),
        ));
    }
    Ok(())
}

/// Arguments for `<runtime> run ...`. Paths and names are passed as single
/// arguments, never interpolated into a shell string.
pub fn build_run_args(config: &SandboxConfig, container_name: &str, task_dir: &Path) -> Vec<OsString> {
    let mut mount = OsString::from("type=bind,readonly,source=");
    mount.push(task_dir.as_os_str());
    mount.push(",target=/task");

    let mut args: Vec<OsString> = [
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--network".to_string(),
        "none".to_string(),
        "--read-only".to_string(),
        "--tmpfs".to_string(),
        format!("/tmp:rw,noexec,nosuid,size={}m", config.tmpfs_size_mb),
        "--memory".to_string(),
        format!("{}m", config.memory_limit_mb),
        "--memory-swap".to_string(),
        format!("{}m", config.memory_limit_mb),
        "--cpus".to_string(),
        format!("{}", config.cpu_limit),
        "--pids-limit".to_string(),
        config.pids_limit.to_string(),
        "--user".to_string(),
        config.user.clone(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "--mount".to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    args.push(mount);
    args.extend(
        [
            config.image.clone(),
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            config.timeout_secs.to_string(),
            "sh".to_string(),
            "/task/script.sh".to_string(),
        ]
        .into_iter()
        .map(OsString::from),
    );
    args
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..cut], s.len())
}

/// Output read from one pipe: at most the cap, plus the total byte count.
#[derive(Debug, Default)]
struct CapturedOutput {
    bytes: Vec<u8>,
    total: u64,
}

/// Keep the first `max_len` bytes of `reader` and discard the rest, so a
/// chatty script cannot grow the host's memory.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    max_len: usize,
) -> std::io::Result<CapturedOutput> {
    let Some(mut reader) = reader else {
        return Ok(CapturedOutput::default());
    };
    let mut bytes = Vec::new();
    (&mut reader).take(max_len as u64).read_to_end(&mut bytes).await?;
    let dropped = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    let total = bytes.len() as u64 + dropped;
    Ok(CapturedOutput { bytes, total })
}

fn render_output(captured: &CapturedOutput) -> String {
    let text = String::from_utf8_lossy(&captured.bytes);
    if captured.total <= captured.bytes.len() as u64 {
        return text.into_owned();
    }
    format!("{text}... [truncated, {} total bytes]", captured.total)
}

/// SIGKILL (137) only counts as a timeout once the time budget was spent;
/// an early 137 is an OOM kill or the script's own exit code.
fn killed_by_timeout(exit_code: i32, elapsed: Duration, timeout_secs: u64) -> bool {
    exit_code == 137 && elapsed >= Duration::from_secs(timeout_secs)
}

fn dir_safe(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect()
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Availability {
    Ready,
    Unavailable(String),
}

/// Runs task scripts in throwaway containers.
///
/// The sandbox image is built lazily on the first run and at most once per
/// runtime instance; runs are independent and may proceed in parallel.
pub struct SandboxRuntime {
    config: SandboxConfig,
    availability: OnceCell<Availability>,
}

impl SandboxRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            availability: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Whether the runtime is usable. Probes (and builds the image) on first call.
    pub async fn is_available(&self) -> bool {
        matches!(self.ensure_image().await, Availability::Ready)
    }

    /// Run a task script.
    ///
    /// # Errors
    /// Invalid scripts, failures preparing task files, or an unavailable
    /// runtime when dry runs are disabled.
    pub async fn run(&self, request: &SandboxRequest) -> OrkestraResult<SandboxResult> {
        validate_script(&request.script)?;

        if let Availability::Unavailable(reason) = self.ensure_image().await {
            if !self.config.allow_dry_run {
                return Err(OrkestraError::Sandbox(format!(
                    "container runtime unavailable and dry runs are disabled: {reason}"
                )));
            }
            warn!(
                task_id = %request.task_id,
                reason = %reason,
                script_bytes = request.script.len(),
                "sandbox unavailable, DRY RUN: script was NOT executed"
            );
            return Ok(SandboxResult {
                exit_code: 0,
                stdout: format!(
                    "[dry-run] task {} would execute:\n{}",
                    request.task_id,
                    truncate_output(&request.script, self.config.max_output_bytes)
                ),
                stderr: String::new(),
                duration_ms: 0,
                timed_out: false,
                mode: SandboxMode::DryRun,
            });
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let container_name = format!("orkestra-{run_id}");
        let task_dir = self
            .config
            .work_root
            .join(format!("{}-{run_id}", dir_safe(&request.task_id)));

        self.write_task_files(&task_dir, request).await?;
        let result = self.run_container(&container_name, &task_dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&task_dir).await {
            debug!(dir = %task_dir.display(), error = %e, "failed to clean sandbox task dir");
        }
        let result = result?;

        info!(
            task_id = %request.task_id,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            timed_out = result.timed_out,
            "sandbox run finished"
        );
        Ok(result)
    }

    async fn write_task_files(&self, dir: &Path, request: &SandboxRequest) -> OrkestraResult<()> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join("script.sh"), request.script.as_bytes()).await?;
        tokio::fs::write(dir.join("input.json"), serde_json::to_vec(&request.input)?).await?;
        Ok(())
    }

    async fn run_container(&self, name: &str, task_dir: &Path) -> OrkestraResult<SandboxResult> {
        let args = build_run_args(&self.config, name, task_dir);
        let start = Instant::now();

        let mut child = Command::new(&self.config.runtime_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrkestraError::Sandbox(format!("failed to start container: {e}")))?;

        let cap = self.config.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (stdout, stderr, status) = tokio::join!(
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            );
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        };

        // Grace period over the in-container `timeout` for runtime startup.
        let hard_limit = Duration::from_secs(self.config.timeout_secs.saturating_add(5));
        match tokio::time::timeout(hard_limit, collect).await {
            Ok(Ok((stdout, stderr, status))) => {
                let exit_code = status.code().unwrap_or(-1);
                let elapsed = start.elapsed();
                let timed_out = killed_by_timeout(exit_code, elapsed, self.config.timeout_secs);
                if exit_code == 137 && !timed_out {
                    warn!(container = name, "sandbox process killed before its timeout, likely out of memory");
                }
                Ok(SandboxResult {
                    exit_code,
                    stdout: render_output(&stdout),
                    stderr: render_output(&stderr),
                    duration_ms: elapsed.as_millis() as u64,
                    timed_out,
                    mode: SandboxMode::Contained,
                })
            }
            Ok(Err(e)) => Err(OrkestraError::Sandbox(format!(
                "failed to collect container output: {e}"
            ))),
            Err(_) => {
                warn!(container = name, "sandbox hard timeout, killing container");
                let _ = Command::new(&self.config.runtime_binary)
                    .args(["kill", name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                Ok(SandboxResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("killed after {}s timeout", self.config.timeout_secs),
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: true,
                    mode: SandboxMode::Contained,
                })
            }
        }
    }

    async fn ensure_image(&self) -> Availability {
        self.availability
            .get_or_init(|| async {
                match self.prepare_image().await {
                    Ok(()) => Availability::Ready,
                    Err(reason) => {
                        warn!(runtime = %self.config.runtime_binary, reason = %reason, "container runtime unavailable");
                        Availability::Unavailable(reason)
                    }
                }
            })
            .await
            .clone()
    }

    async fn prepare_image(&self) -> Result<(), String> {
        let probe = Duration::from_secs(10);
        let version = tokio::time::timeout(
            probe,
            Command::new(&self.config.runtime_binary)
                .args(["version", "--format", "{{.Server.Version}}"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        .map_err(|_| "runtime probe timed out".to_string())?
        .map_err(|e| format!("cannot execute '{}': {e}", self.config.runtime_binary))?;
        if !version.success() {
            return Err(format!("'{} version' failed: {version}", self.config.runtime_binary));
        }

        let present = Command::new(&self.config.runtime_binary)
            .args(["image", "inspect", &self.config.image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if present {
            return Ok(());
        }

        info!(image = %self.config.image, base = %self.config.base_image, "building sandbox image");
        let mut build = Command::new(&self.config.runtime_binary)
            .args(["build", "-t", &self.config.image, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("cannot start image build: {e}"))?;
        if let Some(mut stdin) = build.stdin.take() {
            stdin
                .write_all(self.config.dockerfile().as_bytes())
                .await
                .map_err(|e| format!("cannot stream Dockerfile: {e}"))?;
        }
        let output = build
            .wait_with_output()
            .await
            .map_err(|e| format!("image build failed: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "image build failed: {}",
                truncate_output(&String::from_utf8_lossy(&output.stderr), 2_000)
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
