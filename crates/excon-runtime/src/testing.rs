//! A scripted [`Invoker`] for driving the containerizer without processes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Mutex;

use excon_protocol::{ContainerId, HelperCommand};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::oneshot;

use crate::error::ContainerizerError;
use crate::invoke::{ExitStatus, Invocation, Invoker};
use crate::registry::Sandbox;

/// What the next invocation of a sub-command does.
pub(crate) enum Script {
    /// Write `stdout` and exit with `code` right away.
    Exit { code: i32, stdout: Vec<u8> },
    /// Block until killed through [`Invoker::terminate`].
    Hold,
    /// Block until the paired sender supplies the exit code and stdout.
    Gate(oneshot::Receiver<(i32, Vec<u8>)>),
    /// Fail to start.
    SpawnFail,
}

impl Script {
    pub fn reply(stdout: &str) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.as_bytes().to_vec(),
        }
    }

    pub fn exit(code: i32) -> Self {
        Self::Exit {
            code,
            stdout: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub command: HelperCommand,
    pub container_id: ContainerId,
    pub input: serde_json::Value,
    pub env: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    scripts: HashMap<HelperCommand, VecDeque<Script>>,
    calls: Vec<Call>,
    held: HashMap<u32, oneshot::Sender<()>>,
    killed: Vec<u32>,
    next_pid: u32,
}

/// Plays back queued [`Script`]s per sub-command and records every call.
///
/// With nothing queued, `wait` holds and everything else exits 0 silently.
#[derive(Default)]
pub(crate) struct ScriptedInvoker {
    state: Mutex<State>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, command: HelperCommand, script: Script) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(command)
            .or_default()
            .push_back(script);
    }

    /// Queue a gated invocation and return the sender that releases it.
    pub fn gate(&self, command: HelperCommand) -> oneshot::Sender<(i32, Vec<u8>)> {
        let (release, gate) = oneshot::channel();
        self.script(command, Script::Gate(gate));
        release
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn commands(&self) -> Vec<HelperCommand> {
        self.calls().into_iter().map(|call| call.command).collect()
    }

    pub fn count(&self, command: HelperCommand) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.command == command)
            .count()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.state.lock().unwrap().killed.clone()
    }
}

impl Invoker for ScriptedInvoker {
    fn invoke(
        &self,
        command: HelperCommand,
        _sandbox: &Sandbox,
        input: Vec<u8>,
        env: &BTreeMap<String, String>,
    ) -> Result<Invocation, ContainerizerError> {
        let input: serde_json::Value = serde_json::from_slice(&input).unwrap();
        let container_id = ContainerId::new(input["container_id"].as_str().unwrap());

        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            command,
            container_id,
            input,
            env: env.clone(),
        });

        let script = state
            .scripts
            .get_mut(&command)
            .and_then(VecDeque::pop_front)
            .unwrap_or(match command {
                HelperCommand::Wait => Script::Hold,
                _ => Script::exit(0),
            });

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;

        let (output, status): (BoxFuture<'static, io::Result<Vec<u8>>>, BoxFuture<'static, ExitStatus>) =
            match script {
                Script::Exit { code, stdout } => (
                    future::ready(Ok(stdout)).boxed(),
                    future::ready(ExitStatus::Exited(code)).boxed(),
                ),
                Script::Hold => {
                    let (kill, killed) = oneshot::channel();
                    state.held.insert(pid, kill);
                    (
                        future::pending().boxed(),
                        killed.map(|_| ExitStatus::Signaled(9)).boxed(),
                    )
                }
                Script::Gate(gate) => {
                    let released = gate
                        .map(|released| released.unwrap_or((1, Vec::new())))
                        .shared();
                    (
                        released.clone().map(|(_, stdout)| Ok(stdout)).boxed(),
                        released.map(|(code, _)| ExitStatus::Exited(code)).boxed(),
                    )
                }
                Script::SpawnFail => {
                    return Err(ContainerizerError::SpawnFailure {
                        command,
                        reason: "scripted spawn failure".into(),
                    });
                }
            };

        Ok(Invocation {
            command,
            pid: Some(pid),
            output,
            status,
        })
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.held.remove(&pid) {
            Some(kill) => {
                let _ = kill.send(());
                state.killed.push(pid);
                Ok(())
            }
            // ESRCH
            None => Err(io::Error::from_raw_os_error(3)),
        }
    }
}
