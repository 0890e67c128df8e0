use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Externally assigned container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContainerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Named scalar resources, e.g. `cpus = 2.0`, `mem = 512.0` (MB).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, f64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn cpus(&self) -> Option<f64> {
        self.get("cpus")
    }

    pub fn mem_mb(&self) -> Option<f64> {
        self.get("mem")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of both allocations, resource by resource.
    pub fn plus(&self, other: &Resources) -> Resources {
        let mut sum = self.clone();
        for (name, value) in other.iter() {
            *sum.0.entry(name.to_string()).or_insert(0.0) += value;
        }
        sum
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// The command an executor (or a task) runs inside its container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub framework_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: CommandInfo,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
}

/// Sub-commands understood by the helper program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperCommand {
    Launch,
    Update,
    Usage,
    Wait,
    Destroy,
}

impl HelperCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Update => "update",
            Self::Usage => "usage",
            Self::Wait => "wait",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message written to the helper's stdin.
///
/// Each request type is bound to exactly one sub-command, so callers cannot
/// send an `UpdateRequest` to `wait`.
pub trait Request: Serialize {
    const COMMAND: HelperCommand;

    fn container_id(&self) -> &ContainerId;
}

/// A message the helper writes to stdout before exiting.
pub trait Reply: DeserializeOwned {
    const NAME: &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub container_id: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_info: Option<TaskInfo>,
    pub executor_info: ExecutorInfo,
    pub directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub agent_id: String,
    pub agent_pid: String,
    #[serde(default)]
    pub checkpoint: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub container_id: ContainerId,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRequest {
    pub container_id: ContainerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitRequest {
    pub container_id: ContainerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub container_id: ContainerId,
}

macro_rules! bind_request {
    ($($ty:ty => $command:ident),* $(,)?) => {
        $(
            impl Request for $ty {
                const COMMAND: HelperCommand = HelperCommand::$command;

                fn container_id(&self) -> &ContainerId {
                    &self.container_id
                }
            }
        )*
    };
}

bind_request! {
    LaunchRequest => Launch,
    UpdateRequest => Update,
    UsageRequest => Usage,
    WaitRequest => Wait,
    DestroyRequest => Destroy,
}

/// Resource usage snapshot reported by `usage`.
///
/// Every counter is optional; helpers report what their isolation layer
/// can measure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    /// Seconds since the Unix epoch at which the sample was taken.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_user_time_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_system_time_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_nr_periods: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_nr_throttled: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_rss_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_limit_bytes: Option<u64>,
}

impl Reply for ResourceStatistics {
    const NAME: &'static str = "ResourceStatistics";
}

/// Why a container ended, as reported by `wait`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    /// Whether the container was killed rather than exiting on its own.
    pub killed: bool,
    pub message: String,
    /// Exit status of the executor, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl Reply for Termination {
    const NAME: &'static str = "Termination";
}
