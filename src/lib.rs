// Mining session library: provisioning, config rendering, supervision and metrics
pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod profile;
pub mod progress;
pub mod provision;
pub mod render;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod tailer;
pub mod types;

// Re-export for convenience
pub use backend::{Backend, BackendKind};
pub use channel::MetricsStream;
pub use error::{ErrorKind, SessionError, SessionResult};
pub use profile::MiningProfile;
pub use provision::{CancelToken, ProvisionState, Provisioner};
pub use render::ConfigGenerator;
pub use session::{MiningHost, Session, SessionHandle, SessionOptions};
pub use supervisor::{ProcessSupervisor, WorkerState};
pub use types::{MetricsEvent, SessionEvent, WorkerExit};
