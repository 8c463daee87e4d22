use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const OUTPUT_GRACE: Duration = Duration::from_secs(2);
const REDACTED: &str = "****";

/// A single external command a stage wants executed.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    secrets: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks a value that must never appear in logs or reports.
    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    pub fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret, REDACTED))
    }

    /// Command line with secrets masked.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        self.redact(&line)
    }

    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Last `limit` non-empty lines of stdout followed by stderr.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let lines: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .filter(|line| !line.trim().is_empty())
            .collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..].iter().map(|line| line.to_string()).collect()
    }

    /// Short human-readable reason for a failed command.
    pub fn describe_failure(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let status = match self.code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        };
        match self.stderr.lines().rev().find(|line| !line.trim().is_empty()) {
            Some(line) => format!("{status}: {}", line.trim()),
            None => status,
        }
    }
}

/// Seam between stages and the operating system.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs invocations as child processes, capturing their output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.workdir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        debug!(command = %invocation.display(), "Spawning command");
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to execute '{}'", invocation.program))?;

        let stdout = child.stdout.take().map(PipeReader::spawn);
        let stderr = child.stderr.take().map(PipeReader::spawn);

        let started = Instant::now();
        let mut timed_out = false;
        let status = match invocation.timeout {
            None => Some(child.wait().context("Failed to wait for command")?),
            Some(limit) => loop {
                if let Some(status) = child.try_wait().context("Failed to poll command")? {
                    break Some(status);
                }
                if started.elapsed() >= limit {
                    kill_tree(&mut child);
                    let _ = child.wait();
                    timed_out = true;
                    break None;
                }
                thread::sleep(POLL_INTERVAL);
            },
        };

        // Processes left running in the background may hold the pipes open.
        let deadline = Instant::now() + OUTPUT_GRACE;
        let stdout = stdout.map(|reader| reader.collect(deadline)).unwrap_or_default();
        let stderr = stderr.map(|reader| reader.collect(deadline)).unwrap_or_default();

        Ok(CommandOutput {
            code: status.and_then(|status| status.code()),
            stdout: invocation.redact(&stdout),
            stderr: invocation.redact(&stderr),
            timed_out,
        })
    }
}

/// Kill the child and everything in its process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: the child was spawned as the leader of its own process group.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

/// Drains a child pipe on its own thread, keeping what has been read so far.
struct PipeReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: thread::JoinHandle<()>,
}

impl PipeReader {
    fn spawn<R>(mut pipe: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        if let Ok(mut buffer) = sink.lock() {
                            buffer.extend_from_slice(&chunk[..read]);
                        }
                    }
                }
            }
        });
        Self { buffer, handle }
    }

    /// Output read until the pipe closes or `deadline` passes, whichever is first.
    fn collect(self, deadline: Instant) -> String {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
        }
        self.buffer
            .lock()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_secrets() {
        let invocation = Invocation::new("mvn")
            .arg("sonar:sonar")
            .arg("-Dsonar.token=squ_abc123")
            .secret("squ_abc123");
        assert_eq!(invocation.display(), "mvn sonar:sonar -Dsonar.token=****");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "one\ntwo\n\nthree\n".into(),
            stderr: "boom\n".into(),
            timed_out: false,
        };
        assert_eq!(output.tail(2), vec!["three", "boom"]);
        assert_eq!(output.describe_failure(), "exited with status 1: boom");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_exit_status() {
        let output = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "echo hello; exit 3"]))
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert!(output.stdout.contains("hello"));
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_kills_on_timeout() {
        let output = SystemRunner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "sleep 5"])
                    .timeout(Some(Duration::from_millis(200))),
            )
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let output = SystemRunner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "sleep 4; echo done"])
                    .timeout(Some(Duration::from_millis(300))),
            )
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.stdout.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn background_process_does_not_block_completion() {
        let started = Instant::now();
        let output = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "sleep 6 & echo started"]))
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }
}
