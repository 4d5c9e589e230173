//! Tool subprocess adapter.
//!
//! Spawns one child per stdio server definition and frames its stdio as
//! newline-delimited JSON: each line is one complete JSON value.
//! Serialized JSON never contains raw newlines (JSON strings escape
//! them), so writing `frame + '\n'` preserves framing boundaries.
//!
//! A pump task validates and forwards stdout lines on a bounded channel;
//! when the channel is full the pump stops reading, which propagates
//! OS-pipe backpressure to the child. Stderr is unstructured diagnostic
//! text and is forwarded to the log line by line.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use weft_config::{ServerDefinition, ServerKind};

use crate::error::{BridgeError, BridgeResult};

/// Frames buffered between the stdout pump and the consumer.
const FRAME_BUFFER: usize = 64;

/// A running tool subprocess with framed stdio.
///
/// Stdin writes go through a dedicated writer task fed by a bounded
/// channel, which serializes frames and carries pipe backpressure to
/// senders.
pub struct ToolProcess {
    name: String,
    child: Child,
    stdin_tx: mpsc::Sender<String>,
    frames: mpsc::Receiver<String>,
}

impl ToolProcess {
    /// Spawn the child described by `definition`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotStdio`] for non-stdio definitions and
    /// [`BridgeError::Spawn`] when the process cannot be started. Spawn
    /// failure is terminal for this attempt; the caller retries with
    /// backoff.
    pub fn spawn(definition: &ServerDefinition) -> BridgeResult<Self> {
        let name = definition.name.clone();
        if definition.kind != ServerKind::Stdio {
            return Err(BridgeError::NotStdio { server: name });
        }
        let Some(command) = &definition.command else {
            return Err(BridgeError::NotStdio { server: name });
        };

        let mut cmd = Command::new(command);
        cmd.args(&definition.args)
            .envs(&definition.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
            server: name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn {
                server: name.clone(),
                source: std::io::Error::other("no stdin pipe"),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn {
                server: name.clone(),
                source: std::io::Error::other("no stdout pipe"),
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stderr(name.clone(), stderr));
        }

        let (frame_tx, frames) = mpsc::channel(FRAME_BUFFER);
        tokio::spawn(pump_stdout(name.clone(), stdout, frame_tx));

        let (stdin_tx, stdin_rx) = mpsc::channel(FRAME_BUFFER);
        tokio::spawn(pump_stdin(name.clone(), stdin, stdin_rx));

        info!(server = %name, pid = ?child.id(), "Tool subprocess spawned");
        Ok(Self {
            name,
            child,
            stdin_tx,
            frames,
        })
    }

    /// Server name this process was spawned for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the child is still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write one frame to the child's stdin.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError`] when the stdin pipe has closed. A full
    /// pipe blocks here through the bounded channel, applying
    /// backpressure to the caller.
    pub async fn write_frame(&self, frame: &Value) -> BridgeResult<()> {
        let line = serde_json::to_string(frame)?;
        self.write_raw(&line).await
    }

    /// Write an already-serialized JSON value as one frame.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError`] when the stdin pipe has closed.
    pub async fn write_raw(&self, json: &str) -> BridgeResult<()> {
        self.stdin_tx
            .send(json.to_string())
            .await
            .map_err(|_| BridgeError::Io(std::io::Error::other("subprocess stdin closed")))
    }

    /// A clonable sender feeding the child's stdin, one JSON value per
    /// message. Used by the splice loop for bounded-buffer forwarding.
    #[must_use]
    pub fn writer(&self) -> mpsc::Sender<String> {
        self.stdin_tx.clone()
    }

    /// Receive the next frame from the child's stdout.
    ///
    /// Yields raw JSON text, already validated as parseable. Returns
    /// `None` when stdout closes (the child exited or shut its pipe),
    /// which the owner treats as a transport failure.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    /// Stop the child: SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn stop(mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id()
            && let Ok(pid) = i32::try_from(pid)
        {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        // Closing the stdin channel ends the writer task, which drops
        // the pipe and unblocks children that wait for EOF.
        drop(self.stdin_tx);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.name, %status, "Tool subprocess exited");
            },
            Ok(Err(e)) => {
                warn!(server = %self.name, error = %e, "Waiting for subprocess failed");
            },
            Err(_) => {
                warn!(server = %self.name, "Grace period elapsed, killing subprocess");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            },
        }
    }
}

impl std::fmt::Debug for ToolProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolProcess")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

/// Drain the stdin channel into the child's pipe, one line per frame.
async fn pump_stdin(server: String, mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            warn!(server = %server, error = %e, "Subprocess stdin write failed");
            break;
        }
    }
    debug!(server = %server, "Subprocess stdin pump finished");
}

/// Read stdout lines, validate JSON, forward on the frame channel.
async fn pump_stdout(server: String, stdout: ChildStdout, frames: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if !line.ends_with('\n') {
                    // Partial line at EOF: discard and stop.
                    warn!(
                        server = %server,
                        bytes = line.len(),
                        "Discarding partial line at subprocess EOF"
                    );
                    break;
                }
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                if serde_json::from_str::<Value>(trimmed).is_err() {
                    warn!(server = %server, "Dropping non-JSON frame from subprocess");
                    continue;
                }
                if frames.send(trimmed.to_string()).await.is_err() {
                    // Consumer gone; stop reading.
                    break;
                }
            },
            Err(e) => {
                warn!(server = %server, error = %e, "Subprocess stdout read error");
                break;
            },
        }
    }
    debug!(server = %server, "Subprocess stdout pump finished");
}

/// Forward stderr lines to the log at info level.
async fn pump_stderr(server: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let msg = line.trim_end();
                if !msg.is_empty() {
                    info!(server = %server, "[stderr] {msg}");
                }
            },
            Err(e) => {
                debug!(server = %server, error = %e, "Subprocess stderr read error");
                break;
            },
        }
    }
}
