use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;

/// One structured reading of worker performance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsEvent {
    pub timestamp: DateTime<Utc>,
    /// Hashes per second, never negative
    pub hashrate: f64,
    /// Accepted shares since session start
    pub accepted: u64,
    /// Rejected shares since session start
    pub rejected: u64,
    pub status: Option<String>,
}

/// Partial reading extracted from a single log line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSample {
    pub hashrate: Option<f64>,
    pub accepted: Option<u64>,
    pub rejected: Option<u64>,
    pub status: Option<String>,
}

impl LogSample {
    pub fn is_empty(&self) -> bool {
        self.hashrate.is_none()
            && self.accepted.is_none()
            && self.rejected.is_none()
            && self.status.is_none()
    }

    /// Returns `Some(self)` when the line carried anything worth reporting
    pub fn non_empty(self) -> Option<Self> {
        if self.is_empty() { None } else { Some(self) }
    }
}

/// How a worker terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    pub fn failure(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Items delivered on a session's event stream
///
/// Everything other than `Metrics` is a control notification and is never
/// dropped by the bounded channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Metrics(MetricsEvent),
    WorkerRestarted { attempt: u32 },
    WorkerExited { status: WorkerExit },
    WorkerCrashed { status: WorkerExit },
    LaunchFailed { reason: String },
    Stopped,
}

impl SessionEvent {
    pub fn is_metrics(&self) -> bool {
        matches!(self, SessionEvent::Metrics(_))
    }

    /// True for events after which the session produces nothing more
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sample_is_filtered() {
        assert!(LogSample::default().non_empty().is_none());

        let sample = LogSample {
            hashrate: Some(10.0),
            ..Default::default()
        };
        assert!(sample.non_empty().is_some());
    }

    #[test]
    fn test_worker_exit_display() {
        assert_eq!(WorkerExit::failure(3).to_string(), "exit code 3");
        let killed = WorkerExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "signal 9");
        assert!(WorkerExit::success().is_success());
    }

    #[test]
    fn test_session_event_tagging() {
        let json = serde_json::to_string(&SessionEvent::WorkerCrashed {
            status: WorkerExit::failure(1),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"worker_crashed\""));
        assert!(!SessionEvent::Stopped.is_metrics());
        assert!(SessionEvent::Stopped.is_terminal());
    }
}
