//! Hooks consumed by the VM-lifecycle and UI layers.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::error::OperationalError;

pub trait Observer: Send + Sync {
    /// A service set started (`true`) or stopped (`false`).
    fn status_changed(&self, _running: bool) {}
    fn operational_error(&self, _err: &OperationalError) {}
    /// A peer completed its protocol handshake.
    fn connection_success(&self) {}
}

pub struct NoopObserver;
impl Observer for NoopObserver {}

/// Forwards every hook to `tracing`.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn status_changed(&self, running: bool) {
        tracing::info!(running, "service status changed");
    }
    fn operational_error(&self, err: &OperationalError) {
        tracing::warn!(phase = ?err.phase, port = ?err.port, "{}", err.message);
    }
    fn connection_success(&self) {
        tracing::debug!("connection established");
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record<'a> {
    Status { timestamp: String, running: bool },
    OperationalError(&'a OperationalError),
    Connected { timestamp: String },
}

/// Appends one JSON object per hook call to a file.
pub struct JsonlObserver {
    file: Mutex<File>,
}

impl JsonlObserver {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, record: &Record<'_>) {
        let Ok(mut json) = serde_json::to_vec(record) else {
            return;
        };
        json.push(b'\n');
        let _ = self.file.lock().write_all(&json);
    }
}

impl Observer for JsonlObserver {
    fn status_changed(&self, running: bool) {
        self.line(&Record::Status {
            timestamp: Utc::now().to_rfc3339(),
            running,
        });
    }
    fn operational_error(&self, err: &OperationalError) {
        self.line(&Record::OperationalError(err));
    }
    fn connection_success(&self) {
        self.line(&Record::Connected {
            timestamp: Utc::now().to_rfc3339(),
        });
    }
}

/// Dispatches to all inner observers in order.
pub struct MultiObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl MultiObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }
}

impl Observer for MultiObserver {
    fn status_changed(&self, running: bool) {
        for obs in &self.observers {
            obs.status_changed(running);
        }
    }
    fn operational_error(&self, err: &OperationalError) {
        for obs in &self.observers {
            obs.operational_error(err);
        }
    }
    fn connection_success(&self) {
        for obs in &self.observers {
            obs.connection_success();
        }
    }
}
