//! The external capture pipeline.
//!
//! The scheduler only ever starts and stops captures; the pipeline itself
//! (demux, encode, teletext extraction) lives outside this crate and
//! emits its buffers out of band. [`ProcessGraph`] drives it as a child
//! process per capture, the way the rest of this server family shells out
//! to its media pipelines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};
use thiserror::Error;

/// Identifies one running capture.
pub type GraphId = u64;

/// Everything the pipeline needs to start one capture.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub tuner: String,
    /// Raw channel name.
    pub channel: String,
    pub transponder: u64,
    pub service_id: u64,
    /// Output file; `None` for teletext-only harvesting captures, which
    /// record nothing.
    pub file: Option<PathBuf>,
}

/// Capture graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no capture command configured")]
    NotConfigured,

    #[error("failed to spawn capture command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Start/stop contract of the external capture pipeline. Both calls are
/// fast and synchronous by contract; the scheduler never waits on the
/// pipeline's data path.
pub trait CaptureGraph: Send + Sync {
    fn start(&self, request: &StartRequest) -> Result<GraphId, GraphError>;
    fn stop(&self, id: GraphId);
}

/// Capture pipeline driven as one child process per capture.
///
/// The configured command line is split on whitespace and the
/// placeholders `{tuner}`, `{channel}`, `{transponder}`, `{service_id}`
/// and `{file}` are substituted; `{file}` becomes the null device for
/// teletext-only captures. Stopping a capture kills its child.
pub struct ProcessGraph {
    command: Vec<String>,
    children: Mutex<HashMap<GraphId, tokio::process::Child>>,
    next_id: AtomicU64,
}

impl ProcessGraph {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.split_whitespace().map(str::to_string).collect(),
            children: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn substitute(template: &str, request: &StartRequest) -> String {
        let file = request
            .file
            .as_ref()
            .map(|f| f.display().to_string())
            .unwrap_or_else(null_device);

        template
            .replace("{tuner}", &request.tuner)
            .replace("{channel}", &request.channel)
            .replace("{transponder}", &request.transponder.to_string())
            .replace("{service_id}", &request.service_id.to_string())
            .replace("{file}", &file)
    }
}

fn null_device() -> String {
    if cfg!(windows) { "NUL" } else { "/dev/null" }.to_string()
}

impl CaptureGraph for ProcessGraph {
    fn start(&self, request: &StartRequest) -> Result<GraphId, GraphError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(GraphError::NotConfigured);
        };

        let mut command = tokio::process::Command::new(program);
        for arg in args {
            command.arg(Self::substitute(arg, request));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        info!(
            "Started capture {} on tuner {} for {} (pid {:?})",
            id,
            request.tuner,
            request.channel,
            child.id()
        );

        if let Ok(mut children) = self.children.lock() {
            children.insert(id, child);
        }
        Ok(id)
    }

    fn stop(&self, id: GraphId) {
        let child = match self.children.lock() {
            Ok(mut children) => children.remove(&id),
            Err(_) => None,
        };

        match child {
            Some(mut child) => {
                debug!("Stopping capture {}", id);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to stop capture {}: {}", id, e);
                }
            }
            None => warn!("Stop requested for unknown capture {}", id),
        }
    }
}
