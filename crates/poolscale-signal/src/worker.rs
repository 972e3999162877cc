//! Signal worker processes.
//!
//! Each loaded signal runs as a child process connected to the engine over
//! a Unix socket bound inside a private (`0700`) temporary directory. The
//! socket path reaches the child through [`SOCKET_ENV`]. A [`SignalHandle`]
//! owns the process, the channel and the directory: dropping it kills the
//! worker and removes the socket.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use poolscale_core::{MetricsByName, SignalIdentity, SignalResourceRequest};

use crate::archive::SignalManifest;
use crate::error::{EvaluationCause, SignalError, SignalResult};
use crate::protocol::{
    decode_line, encode_line, EvaluateRequest, EvaluateResponse, InitAck, InitMessage, SOCKET_ENV,
};

/// Per-handle time limits.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimeouts {
    /// Connect plus parameter acknowledgement.
    pub init: Duration,
    /// One evaluation round trip.
    pub eval: Duration,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    child: Child,
    _socket_dir: TempDir,
}

impl Connection {
    async fn round_trip(&mut self, line: &[u8]) -> Result<EvaluateResponse, EvaluationCause> {
        self.writer
            .write_all(line)
            .await
            .map_err(|e| EvaluationCause::Crashed(format!("write failed: {e}")))?;

        let mut buf = String::new();
        let read = self
            .reader
            .read_line(&mut buf)
            .await
            .map_err(|e| EvaluationCause::Crashed(format!("read failed: {e}")))?;
        if read == 0 {
            let status = match self.child.try_wait() {
                Ok(Some(status)) => status.to_string(),
                _ => "channel closed".to_string(),
            };
            return Err(EvaluationCause::Crashed(status));
        }
        decode_line(&buf).map_err(|e| EvaluationCause::Malformed(e.to_string()))
    }

    async fn terminate(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "signal worker already gone");
        }
    }
}

/// A live, initialized signal worker.
pub struct SignalHandle {
    identity: SignalIdentity,
    pool: String,
    pid: Option<u32>,
    eval_timeout: Duration,
    conn: Mutex<Option<Connection>>,
    alive: AtomicBool,
}

impl SignalHandle {
    /// Spawn the worker described by `manifest` and complete the init
    /// handshake within `timeouts.init`.
    pub async fn spawn(
        identity: &SignalIdentity,
        dir: &Path,
        manifest: &SignalManifest,
        init: &InitMessage,
        timeouts: WorkerTimeouts,
    ) -> SignalResult<Self> {
        let load_error = |reason: String| SignalError::Load {
            signal: identity.clone(),
            reason,
        };

        let socket_dir = tempfile::Builder::new()
            .prefix("poolscale-signal-")
            .tempdir()
            .map_err(|e| load_error(format!("create socket dir: {e}")))?;
        let socket_path = socket_dir.path().join("signal.sock");
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| load_error(format!("bind {}: {e}", socket_path.display())))?;

        let program = manifest.program(dir);
        let mut child = Command::new(&program)
            .args(&manifest.args)
            .envs(&manifest.env)
            .env(SOCKET_ENV, &socket_path)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| load_error(format!("spawn {}: {e}", program.display())))?;
        let pid = child.id();
        forward_output(&mut child, identity);
        debug!(signal = %identity, pool = %init.pool, pid, "signal worker spawned");

        let handshake = tokio::time::timeout(timeouts.init, handshake(&listener, &mut child, init)).await;
        let (reader, writer) = match handshake {
            Ok(Ok(channel)) => channel,
            Ok(Err(reason)) => {
                let _ = child.kill().await;
                return Err(SignalError::Init {
                    signal: identity.clone(),
                    reason,
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(SignalError::Init {
                    signal: identity.clone(),
                    reason: format!("no acknowledgement within {:?}", timeouts.init),
                });
            }
        };

        info!(signal = %identity, pool = %init.pool, pid, "signal initialized");
        Ok(Self {
            identity: identity.clone(),
            pool: init.pool.clone(),
            pid,
            eval_timeout: timeouts.eval,
            conn: Mutex::new(Some(Connection {
                reader,
                writer,
                child,
                _socket_dir: socket_dir,
            })),
            alive: AtomicBool::new(true),
        })
    }

    pub fn identity(&self) -> &SignalIdentity {
        &self.identity
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// False once the worker timed out, crashed, misbehaved, or was closed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send one metrics snapshot and wait for the worker's answer.
    ///
    /// `Ok(None)` means the signal declined. Any failure kills the worker
    /// and leaves the handle dead.
    pub async fn evaluate(
        &self,
        metrics: &MetricsByName,
    ) -> SignalResult<Option<SignalResourceRequest>> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(self.evaluation_error(EvaluationCause::Dead));
        };

        let request = EvaluateRequest {
            metrics: metrics.clone(),
        };
        let line = encode_line(&request)
            .map_err(|e| self.evaluation_error(EvaluationCause::Malformed(e.to_string())))?;

        let cause = match tokio::time::timeout(self.eval_timeout, conn.round_trip(&line)).await {
            Ok(Ok(response)) => {
                let request = response.into_request();
                debug!(
                    signal = %self.identity,
                    pool = %self.pool,
                    request = %request.unwrap_or_default(),
                    "signal evaluated"
                );
                return Ok(request);
            }
            Ok(Err(cause)) => cause,
            Err(_) => EvaluationCause::Timeout,
        };

        warn!(signal = %self.identity, pool = %self.pool, %cause, "killing signal worker");
        self.alive.store(false, Ordering::Release);
        if let Some(conn) = guard.take() {
            conn.terminate().await;
        }
        Err(self.evaluation_error(cause))
    }

    /// Kill the worker and release its socket. Safe to call repeatedly.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        if let Some(conn) = self.conn.lock().await.take() {
            conn.terminate().await;
            debug!(signal = %self.identity, pool = %self.pool, "signal closed");
        }
    }

    fn evaluation_error(&self, cause: EvaluationCause) -> SignalError {
        SignalError::Evaluation {
            signal: self.identity.clone(),
            cause,
        }
    }
}

async fn handshake(
    listener: &UnixListener,
    child: &mut Child,
    init: &InitMessage,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), String> {
    let stream = tokio::select! {
        accepted = listener.accept() => accepted.map_err(|e| format!("accept: {e}"))?.0,
        status = child.wait() => {
            return Err(match status {
                Ok(status) => format!("worker exited before connecting ({status})"),
                Err(e) => format!("wait for worker: {e}"),
            });
        }
    };

    let (read, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read);
    let line = encode_line(init).map_err(|e| format!("encode init: {e}"))?;
    writer
        .write_all(&line)
        .await
        .map_err(|e| format!("send init: {e}"))?;

    let mut buf = String::new();
    let read = reader
        .read_line(&mut buf)
        .await
        .map_err(|e| format!("read ack: {e}"))?;
    if read == 0 {
        return Err("worker closed the channel before acknowledging".to_string());
    }
    let ack: InitAck = decode_line(&buf).map_err(|e| format!("bad ack {:?}: {e}", buf.trim_end()))?;
    if !ack.ack {
        return Err("worker rejected its parameters".to_string());
    }
    Ok((reader, writer))
}

/// Forward worker stdout/stderr lines to tracing under the `signal` target,
/// filterable via RUST_LOG (e.g. `RUST_LOG=info,signal=warn`).
fn forward_output(child: &mut Child, identity: &SignalIdentity) {
    if let Some(stdout) = child.stdout.take() {
        let name = identity.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "signal", signal = %name, stream = "stdout", "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let name = identity.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "signal", signal = %name, stream = "stderr", "{}", line);
            }
        });
    }
}
