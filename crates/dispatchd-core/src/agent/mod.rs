//! Spawns and reaps the external agent process.
//!
//! Upstream supports a pluggable harness registry (Claude Code, and
//! whatever else implements the trait). This supervisor talks to exactly
//! one kind of agent, so that abstraction collapses into a single
//! concrete spawner: build the command line, pipe stdout/stderr into a
//! bounded capture, and terminate with SIGTERM-then-SIGKILL on request.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::SupervisorError;

/// Verbs that keep a short prompt from being treated as a bare shell
/// command needing the "Execute the following bash command" wrapper.
const COMMAND_VERBS: &[&str] = &["run", "execute", "perform", "bash", "command"];

/// Apply the bare-command heuristic: prompts of three words or fewer that
/// don't already read like an instruction get wrapped so the agent
/// understands it's being asked to run a shell command verbatim.
pub fn build_prompt(prompt: &str) -> String {
    let tokens: Vec<&str> = prompt.split_whitespace().collect();
    let reads_like_instruction = tokens
        .iter()
        .any(|t| COMMAND_VERBS.contains(&t.to_lowercase().as_str()));

    if tokens.len() <= 3 && !reads_like_instruction {
        format!("Execute the following bash command: {prompt}")
    } else {
        prompt.to_string()
    }
}

/// What the worker pool asks the agent spawner to run.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: Uuid,
    pub worker_id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub max_output_bytes: usize,
}

impl SpawnRequest {
    pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1 << 20;
}

/// A bounded capture of a stream's bytes. Once `max_bytes` is reached,
/// further bytes are dropped and `truncated` is set so checkpoints can
/// say so rather than silently losing the tail.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    max_bytes: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max_bytes,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.max_bytes.saturating_sub(self.bytes.len());
        if chunk.len() > remaining {
            self.bytes.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Last `n` lines, used by checkpoint capture for the output/error
    /// summary columns.
    pub fn tail_lines(&self, n: usize) -> String {
        let text = self.as_str();
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Read `reader` to EOF, pushing every chunk into `buffer`. Read errors
/// end the drain silently; the process exit path is what surfaces
/// failure, not a half-read pipe.
async fn drain_into(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    buffer: Arc<Mutex<OutputBuffer>>,
) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.lock().await.push(&chunk[..n]);
            }
        }
    }
}

/// Drain a stream to EOF into an owned buffer, independent of any shared
/// state. Used by callers (the worker pool) that need to join the drain
/// task separately from racing the process's exit against a timeout.
pub async fn drain(mut reader: impl tokio::io::AsyncRead + Unpin, max_bytes: usize) -> OutputBuffer {
    let mut buf = OutputBuffer::new(max_bytes);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.push(&chunk[..n]),
        }
    }
    buf
}

/// A spawned agent process and the pipes the pool drains concurrently
/// with waiting on it.
pub struct AgentProcess {
    child: Child,
    pid: u32,
}

impl AgentProcess {
    /// Launch `binary_path --print --dangerously-skip-permissions
    /// --output-format json <prompt>` in `request.working_dir`.
    pub fn spawn(binary_path: &str, request: &SpawnRequest) -> Result<Self, SupervisorError> {
        let prompt = build_prompt(&request.prompt);

        let mut cmd = Command::new(binary_path);
        cmd.arg("--print")
            .arg("--dangerously-skip-permissions")
            .arg("--output-format")
            .arg("json")
            .arg(&prompt)
            .current_dir(&request.working_dir)
            .env("DISPATCHD_WORKER_ID", &request.worker_id)
            .env("DISPATCHD_TASK_ID", request.task_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(SupervisorError::SpawnFailed)?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Internal("spawned child reported no pid".into()))?;

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Drain stdout and stderr concurrently into their own bounded
    /// buffers and wait for exit. Returns the exit status alongside both
    /// captures.
    pub async fn run_to_completion(
        &mut self,
        max_output_bytes: usize,
    ) -> std::io::Result<(std::process::ExitStatus, OutputBuffer, OutputBuffer)> {
        let stdout_buf = Arc::new(Mutex::new(OutputBuffer::new(max_output_bytes)));
        let stderr_buf = Arc::new(Mutex::new(OutputBuffer::new(max_output_bytes)));

        let stdout = self.take_stdout();
        let stderr = self.take_stderr();

        let stdout_task = stdout.map(|r| tokio::spawn(drain_into(r, Arc::clone(&stdout_buf))));
        let stderr_task = stderr.map(|r| tokio::spawn(drain_into(r, Arc::clone(&stderr_buf))));

        let status = self.child.wait().await?;

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let stdout_buf = Arc::try_unwrap(stdout_buf).map(Mutex::into_inner).unwrap_or_default();
        let stderr_buf = Arc::try_unwrap(stderr_buf).map(Mutex::into_inner).unwrap_or_default();

        Ok((status, stdout_buf, stderr_buf))
    }

    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for natural exit. Safe to call again after a prior successful
    /// wait; tokio caches and returns the exit status.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Terminate gracefully, falling back to a hard kill if the process
    /// hasn't exited by the time `grace` elapses.
    pub async fn kill(&mut self, grace: Duration) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: pid belongs to a child this struct owns and has not
            // yet been reaped.
            let ret = unsafe { libc::kill(self.pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid = self.pid, "SIGTERM failed, proceeding straight to SIGKILL");
                return self.child.kill().await;
            }

            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(_)) => Ok(()),
                _ => self.child.kill().await,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = grace;
            self.child.kill().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(working_dir: &std::path::Path, prompt: &str) -> SpawnRequest {
        SpawnRequest {
            task_id: Uuid::new_v4(),
            worker_id: "worker-1234".to_string(),
            prompt: prompt.to_string(),
            working_dir: working_dir.to_path_buf(),
            max_output_bytes: SpawnRequest::DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn bare_short_prompt_gets_wrapped() {
        assert_eq!(
            build_prompt("ls -la"),
            "Execute the following bash command: ls -la"
        );
    }

    #[test]
    fn instruction_like_prompt_is_untouched() {
        let prompt = "please run the test suite and report results";
        assert_eq!(build_prompt(prompt), prompt);
    }

    #[test]
    fn short_prompt_with_verb_is_untouched() {
        assert_eq!(build_prompt("run tests"), "run tests");
    }

    #[test]
    fn output_buffer_truncates_past_capacity() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"hello world");
        assert!(buf.truncated());
        assert_eq!(buf.as_str(), "hell");
    }

    #[test]
    fn output_buffer_tail_lines() {
        let mut buf = OutputBuffer::new(1024);
        buf.push(b"one\ntwo\nthree\nfour\n");
        assert_eq!(buf.tail_lines(2), "three\nfour");
    }

    #[tokio::test]
    async fn spawn_binary_not_found_returns_error() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(tmp.path(), "do something");
        let err = AgentProcess::spawn("/nonexistent/path/to/agent", &req).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SpawnFailed);
    }

    #[tokio::test]
    async fn spawn_captures_stdout_and_exit_status() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_agent.sh",
            "#!/bin/sh\necho '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        );

        let req = request(tmp.path(), "summarize this repository");
        let mut proc = AgentProcess::spawn(script.to_str().unwrap(), &req).unwrap();
        let (status, stdout, stderr) = proc
            .run_to_completion(req.max_output_bytes)
            .await
            .unwrap();

        assert!(status.success());
        assert!(stdout.as_str().contains("\"result\":\"ok\""));
        assert!(stderr.as_str().is_empty());
    }

    #[tokio::test]
    async fn spawn_sets_working_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let work_dir = tmp.path().join("workdir");
        std::fs::create_dir(&work_dir).unwrap();
        let script = write_script(tmp.path(), "pwd_agent.sh", "#!/bin/sh\npwd\n");

        let req = request(&work_dir, "print the working directory");
        let mut proc = AgentProcess::spawn(script.to_str().unwrap(), &req).unwrap();
        let (_, stdout, _) = proc.run_to_completion(req.max_output_bytes).await.unwrap();

        let canonical_work = work_dir.canonicalize().unwrap_or(work_dir.clone());
        let printed = PathBuf::from(stdout.as_str().trim());
        let canonical_printed = printed.canonicalize().unwrap_or(printed);
        assert_eq!(canonical_printed, canonical_work);
    }

    #[tokio::test]
    async fn spawn_injects_task_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "env_agent.sh",
            "#!/bin/sh\necho \"$DISPATCHD_WORKER_ID\"\n",
        );

        let req = request(tmp.path(), "print the worker id");
        let mut proc = AgentProcess::spawn(script.to_str().unwrap(), &req).unwrap();
        let (_, stdout, _) = proc.run_to_completion(req.max_output_bytes).await.unwrap();

        assert_eq!(stdout.as_str().trim(), "worker-1234");
    }

    #[tokio::test]
    async fn kill_terminates_subprocess() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy_agent.sh", "#!/bin/sh\nsleep 3600\n");

        let req = request(tmp.path(), "sleep forever");
        let mut proc = AgentProcess::spawn(script.to_str().unwrap(), &req).unwrap();
        assert!(proc.try_wait().unwrap().is_none());

        proc.kill(Duration::from_millis(200)).await.unwrap();

        // Give the runtime a moment to reap the process.
        for _ in 0..20 {
            if proc.try_wait().unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not exit after kill");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_in_status() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fail_agent.sh", "#!/bin/sh\nexit 7\n");

        let req = request(tmp.path(), "fail on purpose");
        let mut proc = AgentProcess::spawn(script.to_str().unwrap(), &req).unwrap();
        let (status, _, _) = proc.run_to_completion(req.max_output_bytes).await.unwrap();

        assert_eq!(status.code(), Some(7));
    }
}
