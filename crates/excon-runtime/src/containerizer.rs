use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use excon_protocol::{
    ContainerId, DestroyRequest, ExecutorInfo, LaunchRequest, ResourceStatistics, Resources,
    TaskInfo, Termination, UpdateRequest, UsageRequest, WaitRequest,
};
use tokio::sync::{mpsc, oneshot};

use crate::config::ExconConfig;
use crate::error::ContainerizerError;
use crate::invoke::{self, Invoker, SubprocessInvoker};
use crate::recovery::RecoveryState;
use crate::registry::{Container, Phase, Registry, Sandbox, TerminationOutcome};
use crate::signal::Observer;

type Responder<T> = oneshot::Sender<Result<T, ContainerizerError>>;

/// Everything `launch` needs to start a container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub container_id: ContainerId,
    pub task_info: Option<TaskInfo>,
    pub executor_info: ExecutorInfo,
    pub sandbox: Sandbox,
    pub agent_id: String,
    pub agent_pid: String,
    pub checkpoint: bool,
}

impl LaunchSpec {
    fn request(&self) -> LaunchRequest {
        LaunchRequest {
            container_id: self.container_id.clone(),
            task_info: self.task_info.clone(),
            executor_info: self.executor_info.clone(),
            directory: self.sandbox.directory.clone(),
            user: self.sandbox.user.clone(),
            agent_id: self.agent_id.clone(),
            agent_pid: self.agent_pid.clone(),
            checkpoint: self.checkpoint,
        }
    }

    /// Executor plus task resources.
    fn resources(&self) -> Resources {
        match &self.task_info {
            Some(task) => self.executor_info.resources.plus(&task.resources),
            None => self.executor_info.resources.clone(),
        }
    }

    /// Environment of the `launch` helper: the executor's own variables,
    /// then what the executor needs to find its agent.
    fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.executor_info.command.environment.clone();
        env.extend(environment(&self.container_id, &self.sandbox));
        env.insert("EXCON_AGENT_ID".into(), self.agent_id.clone());
        env.insert("EXCON_AGENT_PID".into(), self.agent_pid.clone());
        env.insert(
            "EXCON_FRAMEWORK_ID".into(),
            self.executor_info.framework_id.clone(),
        );
        env.insert(
            "EXCON_EXECUTOR_ID".into(),
            self.executor_info.executor_id.clone(),
        );
        env.insert(
            "EXCON_CHECKPOINT".into(),
            if self.checkpoint { "1" } else { "0" }.into(),
        );
        env
    }
}

/// Environment common to every helper invocation for a container.
fn environment(id: &ContainerId, sandbox: &Sandbox) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("EXCON_CONTAINER_ID".to_string(), id.to_string()),
        (
            "EXCON_DIRECTORY".to_string(),
            sandbox.directory.display().to_string(),
        ),
    ])
}

/// Termination reported for a container that was destroyed before its
/// `wait` helper said anything.
fn destroyed() -> Termination {
    Termination {
        killed: true,
        message: "Container destroyed".into(),
        status: None,
    }
}

enum Message {
    Recover {
        state: Option<RecoveryState>,
        reply: Responder<()>,
    },
    Launch {
        spec: Box<LaunchSpec>,
        reply: Responder<()>,
    },
    Update {
        id: ContainerId,
        resources: Resources,
        reply: Responder<()>,
    },
    Usage {
        id: ContainerId,
        reply: Responder<ResourceStatistics>,
    },
    Wait {
        id: ContainerId,
        reply: Responder<Observer<TerminationOutcome>>,
    },
    Destroy {
        id: ContainerId,
        reply: Responder<()>,
    },
    Containers {
        reply: Responder<HashSet<ContainerId>>,
    },
    Shutdown,

    // Reported back by helper I/O tasks. `generation` identifies the
    // container record the helper was started for.
    LaunchFinished {
        id: ContainerId,
        result: Result<(), ContainerizerError>,
        reply: Responder<()>,
    },
    UpdateFinished {
        id: ContainerId,
        generation: u64,
        resources: Resources,
        result: Result<(), ContainerizerError>,
        reply: Responder<()>,
    },
    WaitFinished {
        id: ContainerId,
        generation: u64,
        outcome: TerminationOutcome,
    },
    DestroyFinished {
        id: ContainerId,
        generation: u64,
        result: Result<(), ContainerizerError>,
    },
}

/// An operation that arrived while its container was still launching.
pub(crate) enum Deferred {
    Update {
        resources: Resources,
        reply: Responder<()>,
    },
    Usage {
        reply: Responder<ResourceStatistics>,
    },
    Destroy {
        reply: Responder<()>,
    },
}

impl Deferred {
    fn reject(self, err: ContainerizerError) {
        match self {
            Self::Update { reply, .. } | Self::Destroy { reply } => {
                let _ = reply.send(Err(err));
            }
            Self::Usage { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Handle to a containerizer actor.
///
/// Cheap to clone. Every operation is sent to the actor when the method is
/// called, not when the returned future is first polled, so the order of
/// calls is the order the actor sees. The actor stops once the last handle
/// is dropped.
#[derive(Clone)]
pub struct Containerizer {
    inner: Arc<Handle>,
}

struct Handle {
    mailbox: mpsc::UnboundedSender<Message>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.mailbox.send(Message::Shutdown);
    }
}

impl Containerizer {
    /// Start an actor that runs helpers through `invoker`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let actor = ContainerizerActor {
            invoker,
            registry: Registry::default(),
            destroys: HashMap::new(),
            mailbox: mailbox.clone(),
        };
        tokio::spawn(actor.run(inbox));
        Self {
            inner: Arc::new(Handle { mailbox }),
        }
    }

    /// Start an actor that runs the configured helper program.
    pub fn from_config(config: &ExconConfig) -> Self {
        Self::new(Arc::new(SubprocessInvoker::from_config(&config.helper)))
    }

    /// Post a request to the actor now; the returned receiver carries the
    /// reply.
    fn send<T>(
        &self,
        message: impl FnOnce(Responder<T>) -> Message,
    ) -> oneshot::Receiver<Result<T, ContainerizerError>> {
        let (reply, response) = oneshot::channel();
        let _ = self.inner.mailbox.send(message(reply));
        response
    }

    /// Take over containers that were running before a restart.
    pub fn recover(
        &self,
        state: Option<RecoveryState>,
    ) -> impl Future<Output = Result<(), ContainerizerError>> + Send + use<> {
        receive(self.send(|reply| Message::Recover { state, reply }))
    }

    /// Launch a container. Resolves once the `launch` helper has finished.
    pub fn launch(
        &self,
        spec: LaunchSpec,
    ) -> impl Future<Output = Result<(), ContainerizerError>> + Send + use<> {
        receive(self.send(|reply| Message::Launch {
            spec: Box::new(spec),
            reply,
        }))
    }

    pub fn update(
        &self,
        id: &ContainerId,
        resources: Resources,
    ) -> impl Future<Output = Result<(), ContainerizerError>> + Send + use<> {
        let id = id.clone();
        receive(self.send(|reply| Message::Update {
            id,
            resources,
            reply,
        }))
    }

    pub fn usage(
        &self,
        id: &ContainerId,
    ) -> impl Future<Output = Result<ResourceStatistics, ContainerizerError>> + Send + use<> {
        let id = id.clone();
        receive(self.send(|reply| Message::Usage { id, reply }))
    }

    /// Resolves with the container's termination. Every caller for the same
    /// container sees the same outcome.
    pub fn wait(
        &self,
        id: &ContainerId,
    ) -> impl Future<Output = Result<Termination, ContainerizerError>> + Send + use<> {
        let id = id.clone();
        let observer = receive(self.send(|reply| Message::Wait { id, reply }));
        async move {
            observer
                .await?
                .get()
                .await
                .unwrap_or(Err(ContainerizerError::Shutdown))
        }
    }

    /// Destroy a container. Resolves with the outcome of the `destroy`
    /// helper; the container's termination follows regardless.
    pub fn destroy(
        &self,
        id: &ContainerId,
    ) -> impl Future<Output = Result<(), ContainerizerError>> + Send + use<> {
        let id = id.clone();
        receive(self.send(|reply| Message::Destroy { id, reply }))
    }

    /// Ids of every container currently under management.
    pub fn containers(
        &self,
    ) -> impl Future<Output = Result<HashSet<ContainerId>, ContainerizerError>> + Send + use<> {
        receive(self.send(|reply| Message::Containers { reply }))
    }
}

async fn receive<T>(
    response: oneshot::Receiver<Result<T, ContainerizerError>>,
) -> Result<T, ContainerizerError> {
    response.await.unwrap_or(Err(ContainerizerError::Shutdown))
}

/// Owns the registry. Handles one message at a time and never waits on a
/// helper itself; helper I/O runs in spawned tasks that report back through
/// the mailbox.
struct ContainerizerActor {
    invoker: Arc<dyn Invoker>,
    registry: Registry,
    /// Callers waiting on an in-flight `destroy` helper, per container
    /// record.
    destroys: HashMap<(ContainerId, u64), Vec<Responder<()>>>,
    mailbox: mpsc::UnboundedSender<Message>,
}

impl ContainerizerActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message>) {
        tracing::debug!("Containerizer started");
        while let Some(message) = inbox.recv().await {
            if matches!(message, Message::Shutdown) {
                break;
            }
            self.handle(message);
        }
        tracing::info!(
            containers = self.registry.len(),
            "Containerizer stopped"
        );
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Recover { state, reply } => {
                let _ = reply.send(self.recover(state));
            }
            Message::Launch { spec, reply } => self.launch(*spec, reply),
            Message::Update {
                id,
                resources,
                reply,
            } => self.update(id, resources, reply),
            Message::Usage { id, reply } => self.usage(id, reply),
            Message::Wait { id, reply } => {
                let observer = self
                    .registry
                    .get(&id)
                    .map(Container::observe_termination)
                    .ok_or(ContainerizerError::UnknownContainer(id));
                let _ = reply.send(observer);
            }
            Message::Destroy { id, reply } => self.destroy(id, reply),
            Message::Containers { reply } => {
                let _ = reply.send(Ok(self.registry.ids()));
            }
            Message::Shutdown => {}
            Message::LaunchFinished { id, result, reply } => {
                self.launch_finished(id, result, reply)
            }
            Message::UpdateFinished {
                id,
                generation,
                resources,
                result,
                reply,
            } => self.update_finished(id, generation, resources, result, reply),
            Message::WaitFinished {
                id,
                generation,
                outcome,
            } => self.wait_finished(id, generation, outcome),
            Message::DestroyFinished {
                id,
                generation,
                result,
            } => self.destroy_finished(id, generation, result),
        }
    }

    /// Run `task` off the actor and deliver the message it produces.
    fn spawn_continuation<F>(&self, task: F)
    where
        F: Future<Output = Message> + Send + 'static,
    {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let _ = mailbox.send(task.await);
        });
    }

    fn recover(&mut self, state: Option<RecoveryState>) -> Result<(), ContainerizerError> {
        let Some(state) = state else {
            tracing::info!("No containers to recover");
            return Ok(());
        };

        for run in state.live_runs()? {
            let id = run.container_id.clone();
            if let Err(e) = self
                .registry
                .insert(id.clone(), Container::recovered(run.sandbox()))
            {
                tracing::warn!(container_id = %id, "Skipping recovered container: {e}");
                continue;
            }
            tracing::info!(
                container_id = %id,
                directory = %run.directory.display(),
                "Recovered container"
            );
            self.watch(&id);
        }
        Ok(())
    }

    fn launch(&mut self, spec: LaunchSpec, reply: Responder<()>) {
        let id = spec.container_id.clone();
        let container = Container::launching(spec.sandbox.clone(), spec.resources());
        if let Err(e) = self.registry.insert(id.clone(), container) {
            tracing::warn!(container_id = %id, "Rejecting launch: {e}");
            let _ = reply.send(Err(e));
            return;
        }

        tracing::info!(
            container_id = %id,
            directory = %spec.sandbox.directory.display(),
            user = ?spec.sandbox.user,
            "Launching container"
        );

        match invoke::call(
            self.invoker.as_ref(),
            &spec.sandbox,
            &spec.request(),
            &spec.environment(),
        ) {
            Ok(invocation) => self.spawn_continuation(async move {
                let result = invocation.finish().await;
                Message::LaunchFinished { id, result, reply }
            }),
            Err(e) => self.launch_finished(id, Err(e), reply),
        }
    }

    fn launch_finished(
        &mut self,
        id: ContainerId,
        result: Result<(), ContainerizerError>,
        reply: Responder<()>,
    ) {
        let deferred = self
            .registry
            .get_mut(&id)
            .map(Container::mark_launched)
            .unwrap_or_default();

        match result {
            Ok(()) => {
                tracing::info!(container_id = %id, "Container launched");
                let _ = reply.send(Ok(()));
                self.watch(&id);
                for op in deferred {
                    self.dispatch(id.clone(), op);
                }
            }
            Err(e) => {
                tracing::warn!(container_id = %id, "Launch failed: {e}");
                self.terminate(&id, Err(e.clone()));
                let _ = reply.send(Err(e));
                for op in deferred {
                    op.reject(ContainerizerError::UnknownContainer(id.clone()));
                }
            }
        }
    }

    fn dispatch(&mut self, id: ContainerId, op: Deferred) {
        match op {
            Deferred::Update { resources, reply } => self.update(id, resources, reply),
            Deferred::Usage { reply } => self.usage(id, reply),
            Deferred::Destroy { reply } => self.destroy(id, reply),
        }
    }

    /// Start the container's dedicated `wait` helper. Its outcome becomes
    /// the container's termination.
    fn watch(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        let request = WaitRequest {
            container_id: id.clone(),
        };
        let env = environment(id, &container.sandbox);

        match invoke::call(self.invoker.as_ref(), &container.sandbox, &request, &env) {
            Ok(invocation) => {
                container.watching = true;
                container.helper_pid = invocation.pid;
                let generation = container.generation;
                tracing::debug!(container_id = %id, pid = ?invocation.pid, "Wait helper started");
                let id = id.clone();
                self.spawn_continuation(async move {
                    let outcome = invocation.reply::<Termination>().await;
                    Message::WaitFinished {
                        id,
                        generation,
                        outcome,
                    }
                });
            }
            Err(e) => {
                tracing::warn!(container_id = %id, "Failed to start wait helper: {e}");
                self.terminate(id, Err(e));
            }
        }
    }

    fn wait_finished(&mut self, id: ContainerId, generation: u64, outcome: TerminationOutcome) {
        let Some(container) = self.registry.get_current(&id, generation) else {
            tracing::debug!(container_id = %id, "Wait helper finished after cleanup");
            return;
        };
        container.watching = false;
        container.helper_pid = None;

        let outcome = match outcome {
            Err(e) if container.destroying => {
                tracing::debug!(container_id = %id, "Wait helper aborted by destroy: {e}");
                Ok(destroyed())
            }
            outcome => outcome,
        };

        match &outcome {
            Ok(termination) => tracing::info!(
                container_id = %id,
                killed = termination.killed,
                status = ?termination.status,
                message = %termination.message,
                "Container terminated"
            ),
            Err(e) => tracing::warn!(container_id = %id, "Wait helper failed: {e}"),
        }
        self.terminate(&id, outcome);
    }

    fn update(&mut self, id: ContainerId, resources: Resources, reply: Responder<()>) {
        let Some(container) = self.registry.get_mut(&id) else {
            let _ = reply.send(Err(ContainerizerError::UnknownContainer(id)));
            return;
        };
        if let Phase::Launching { deferred } = &mut container.phase {
            tracing::debug!(container_id = %id, "Update queued behind launch");
            deferred.push_back(Deferred::Update { resources, reply });
            return;
        }

        let request = UpdateRequest {
            container_id: id.clone(),
            resources: resources.clone(),
        };
        let env = environment(&id, &container.sandbox);
        let generation = container.generation;
        match invoke::call(self.invoker.as_ref(), &container.sandbox, &request, &env) {
            Ok(invocation) => self.spawn_continuation(async move {
                let result = invocation.finish().await;
                Message::UpdateFinished {
                    id,
                    generation,
                    resources,
                    result,
                    reply,
                }
            }),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn update_finished(
        &mut self,
        id: ContainerId,
        generation: u64,
        resources: Resources,
        result: Result<(), ContainerizerError>,
        reply: Responder<()>,
    ) {
        match &result {
            Ok(()) => {
                if let Some(container) = self.registry.get_current(&id, generation) {
                    container.resources = resources;
                    tracing::info!(
                        container_id = %id,
                        resources = ?container.resources,
                        "Container resources updated"
                    );
                }
            }
            Err(e) => tracing::warn!(container_id = %id, "Update failed: {e}"),
        }
        let _ = reply.send(result);
    }

    fn usage(&mut self, id: ContainerId, reply: Responder<ResourceStatistics>) {
        let Some(container) = self.registry.get_mut(&id) else {
            let _ = reply.send(Err(ContainerizerError::UnknownContainer(id)));
            return;
        };
        if let Phase::Launching { deferred } = &mut container.phase {
            tracing::debug!(container_id = %id, "Usage queued behind launch");
            deferred.push_back(Deferred::Usage { reply });
            return;
        }

        let request = UsageRequest {
            container_id: id.clone(),
        };
        let env = environment(&id, &container.sandbox);
        match invoke::call(self.invoker.as_ref(), &container.sandbox, &request, &env) {
            // Usage never changes container state, so the result goes
            // straight to the caller.
            Ok(invocation) => {
                tokio::spawn(async move {
                    let _ = reply.send(invocation.reply::<ResourceStatistics>().await);
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn destroy(&mut self, id: ContainerId, reply: Responder<()>) {
        let Some(container) = self.registry.get_mut(&id) else {
            let _ = reply.send(Err(ContainerizerError::UnknownContainer(id)));
            return;
        };
        if let Phase::Launching { deferred } = &mut container.phase {
            tracing::debug!(container_id = %id, "Destroy queued behind launch");
            deferred.push_back(Deferred::Destroy { reply });
            return;
        }
        let generation = container.generation;
        if let Some(waiters) = self.destroys.get_mut(&(id.clone(), generation)) {
            tracing::debug!(container_id = %id, "Destroy already in progress");
            waiters.push(reply);
            return;
        }

        container.destroying = true;
        tracing::info!(container_id = %id, "Destroying container");

        let request = DestroyRequest {
            container_id: id.clone(),
        };
        let env = environment(&id, &container.sandbox);
        let invocation = invoke::call(self.invoker.as_ref(), &container.sandbox, &request, &env);
        self.destroys.insert((id.clone(), generation), vec![reply]);

        match invocation {
            Ok(invocation) => self.spawn_continuation(async move {
                let result = invocation.finish().await;
                Message::DestroyFinished {
                    id,
                    generation,
                    result,
                }
            }),
            Err(e) => self.destroy_finished(id, generation, Err(e)),
        }
    }

    fn destroy_finished(
        &mut self,
        id: ContainerId,
        generation: u64,
        result: Result<(), ContainerizerError>,
    ) {
        if let Err(e) = &result {
            tracing::warn!(container_id = %id, "Destroy helper failed: {e}");
        }
        self.unwait(&id, generation);
        let waiters = self
            .destroys
            .remove(&(id, generation))
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Abort a pending `wait` helper so the container's termination
    /// resolves through the helper's exit. A no-op once the record the
    /// destroy was issued for has been cleaned up.
    fn unwait(&mut self, id: &ContainerId, generation: u64) {
        let Some(container) = self.registry.get_current(id, generation) else {
            tracing::debug!(container_id = %id, "Destroyed container already cleaned up");
            return;
        };
        let pid = match (container.watching, container.helper_pid) {
            (true, Some(pid)) => pid,
            _ => {
                self.terminate(id, Ok(destroyed()));
                return;
            }
        };

        tracing::debug!(container_id = %id, pid, "Killing wait helper");
        match self.invoker.terminate(pid) {
            Ok(()) => {}
            // Its exit is already on the way to the mailbox.
            Err(e) if invoke::already_exited(&e) => {}
            Err(e) => {
                tracing::warn!(container_id = %id, pid, "Failed to kill wait helper: {e}");
                self.terminate(id, Ok(destroyed()));
            }
        }
    }

    /// Fulfil the container's termination, then clean it up.
    fn terminate(&mut self, id: &ContainerId, outcome: TerminationOutcome) {
        if let Some(container) = self.registry.get_mut(id) {
            if !container.terminate(outcome) {
                tracing::debug!(container_id = %id, "Termination was already set");
            }
        }
        self.cleanup(id);
    }

    fn cleanup(&mut self, id: &ContainerId) {
        if self.registry.remove(id).is_some() {
            tracing::debug!(container_id = %id, "Container removed");
        }
    }
}
