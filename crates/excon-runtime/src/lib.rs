//! Lifecycle orchestration for containers isolated by an external helper
//! program.
//!
//! [`Containerizer`] is a handle to an actor that owns every container's
//! state. Each lifecycle step runs the helper once (`<helper> launch`,
//! `<helper> wait`, ...) with a JSON request on stdin; see
//! [`excon_protocol`] for the messages.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use excon_protocol::{CommandInfo, ExecutorInfo, Resources};
//! use excon_runtime::{Containerizer, ExconConfig, LaunchSpec, Sandbox};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ExconConfig::for_helper("/usr/libexec/excon-helper");
//! let containerizer = Containerizer::from_config(&config);
//!
//! let id = "c1".into();
//! containerizer
//!     .launch(LaunchSpec {
//!         container_id: "c1".into(),
//!         task_info: None,
//!         executor_info: ExecutorInfo {
//!             executor_id: "exec".into(),
//!             framework_id: "fw".into(),
//!             name: None,
//!             command: CommandInfo {
//!                 value: "/bin/executor".into(),
//!                 ..Default::default()
//!             },
//!             resources: Resources::new().with("cpus", 1.0),
//!         },
//!         sandbox: Sandbox::new("/var/lib/excon/c1", None),
//!         agent_id: config.agent.id.clone(),
//!         agent_pid: config.agent.pid.clone(),
//!         checkpoint: false,
//!     })
//!     .await?;
//!
//! let termination = containerizer.wait(&id).await?;
//! println!("{}", termination.message);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod containerizer;
pub mod error;
pub mod invoke;
pub mod race;
pub mod recovery;
pub mod registry;
pub mod signal;

#[cfg(test)]
mod testing;

pub use config::ExconConfig;
pub use containerizer::{Containerizer, LaunchSpec};
pub use error::{ConfigError, ContainerizerError};
pub use invoke::{ExitStatus, Invoker, SubprocessInvoker};
pub use recovery::{RecoveryState, RunState};
pub use registry::{Sandbox, TerminationOutcome};
