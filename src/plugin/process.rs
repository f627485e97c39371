//! Plugin child-process transport
//!
//! Each plugin is an owned child process. Frames go out over its stdin and
//! come back over its stdout; a reader task dispatches responses to
//! waiting callers by correlation id and routes log frames into the host
//! log with a `plugin` field. When the process dies, every in-flight call
//! fails and the process is left marked dead for the manager to respawn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use super::protocol::{ClientFrame, Outcome, Request, Response, ServerFrame};
use crate::{Error, Result};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Response, String>>>>>;

/// A running plugin process and its framed stdio transport
pub struct PluginProcess {
    command: PathBuf,
    child: AsyncMutex<Child>,
    writer: AsyncMutex<FramedWrite<ChildStdin, LengthDelimitedCodec>>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl PluginProcess {
    /// Spawn the executable and start its frame reader
    pub fn spawn(command: &Path) -> Result<Arc<Self>> {
        let mut child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::plugin(format!("spawning {}: {e}", command.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::plugin("plugin stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::plugin("plugin stdout unavailable"))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let process = Arc::new(Self {
            command: command.to_path_buf(),
            child: AsyncMutex::new(child),
            writer: AsyncMutex::new(FramedWrite::new(stdin, LengthDelimitedCodec::new())),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            alive: alive.clone(),
        });

        let plugin_name = command
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.display().to_string());
        tokio::spawn(read_frames(
            FramedRead::new(stdout, LengthDelimitedCodec::new()),
            pending,
            alive,
            plugin_name,
        ));

        Ok(process)
    }

    /// The executable this process was spawned from
    pub fn command(&self) -> &Path {
        &self.command
    }

    /// Whether the process is still serving calls
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Make a correlated call to the named implementation in this process
    pub async fn call(&self, target: &str, request: Request) -> Result<Response> {
        if !self.is_alive() {
            return Err(Error::plugin(format!(
                "plugin {} is not running",
                self.command.display()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = ClientFrame::Request {
            id,
            target: target.to_string(),
            request,
        };
        let bytes = serde_json::to_vec(&frame)?;

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(bytes.into()).await {
                self.pending.lock().remove(&id);
                self.alive.store(false, Ordering::SeqCst);
                return Err(Error::plugin(format!(
                    "writing to plugin {}: {e}",
                    self.command.display()
                )));
            }
        }

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(msg)) => Err(Error::plugin(msg)),
            Err(_) => Err(Error::plugin(format!(
                "plugin {} exited during call",
                self.command.display()
            ))),
        }
    }

    /// Kill the child process
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(command = %self.command.display(), error = %e, "killing plugin");
        }
    }
}

async fn read_frames(
    mut reader: FramedRead<tokio::process::ChildStdout, LengthDelimitedCodec>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    plugin: String,
) {
    while let Some(frame) = reader.next().await {
        let bytes = match frame {
            Ok(b) => b,
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "plugin transport error");
                break;
            }
        };

        match serde_json::from_slice::<ServerFrame>(&bytes) {
            Ok(ServerFrame::Response { id, outcome }) => {
                let sender = pending.lock().remove(&id);
                match sender {
                    Some(tx) => {
                        let result = match outcome {
                            Outcome::Result(r) => Ok(r),
                            Outcome::Error(msg) => Err(msg),
                        };
                        let _ = tx.send(result);
                    }
                    None => warn!(plugin = %plugin, id, "response for unknown call id"),
                }
            }
            Ok(ServerFrame::Log { level, message }) => match level.as_str() {
                "debug" => debug!(plugin = %plugin, "{message}"),
                "warn" | "warning" => warn!(plugin = %plugin, "{message}"),
                "error" => error!(plugin = %plugin, "{message}"),
                _ => info!(plugin = %plugin, "{message}"),
            },
            Err(e) => warn!(plugin = %plugin, error = %e, "undecodable plugin frame"),
        }
    }

    // Process ended (or stdout closed): fail anything still waiting.
    alive.store(false, Ordering::SeqCst);
    let mut pending = pending.lock();
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(format!("plugin {plugin} exited")));
    }
    info!(plugin = %plugin, "plugin process ended");
}
