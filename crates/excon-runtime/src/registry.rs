use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use excon_protocol::{ContainerId, Resources, Termination};

use crate::containerizer::Deferred;
use crate::error::ContainerizerError;
use crate::signal::{self, Observer, Promise};

/// Working directory and identity every helper invocation for a container
/// runs with. Fixed for the container's whole life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub directory: PathBuf,
    pub user: Option<String>,
}

impl Sandbox {
    pub fn new(directory: impl AsRef<Path>, user: Option<String>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            user,
        }
    }
}

pub type TerminationOutcome = Result<Termination, ContainerizerError>;

/// Where a container is relative to its `launch` invocation.
pub(crate) enum Phase {
    /// The launch helper is running. Operations that must not race it wait
    /// here in arrival order.
    Launching { deferred: VecDeque<Deferred> },
    Launched,
}

pub(crate) struct Container {
    /// Distinguishes this record from earlier ones under the same id, so
    /// helper completions for a cleaned-up container are not applied to a
    /// relaunched one. Assigned by [`Registry::insert`].
    pub generation: u64,
    pub sandbox: Sandbox,
    pub phase: Phase,
    pub resources: Resources,
    /// Whether the dedicated `wait` helper is running.
    pub watching: bool,
    /// Pid of the `wait` helper, killed on destroy.
    pub helper_pid: Option<u32>,
    pub destroying: bool,
    termination: Option<Promise<TerminationOutcome>>,
    observer: Observer<TerminationOutcome>,
}

impl Container {
    fn new(sandbox: Sandbox, phase: Phase, resources: Resources) -> Self {
        let (promise, observer) = signal::signal();
        Self {
            generation: 0,
            sandbox,
            phase,
            resources,
            watching: false,
            helper_pid: None,
            destroying: false,
            termination: Some(promise),
            observer,
        }
    }

    pub fn launching(sandbox: Sandbox, resources: Resources) -> Self {
        Self::new(
            sandbox,
            Phase::Launching {
                deferred: VecDeque::new(),
            },
            resources,
        )
    }

    /// A container that was running before the agent restarted.
    pub fn recovered(sandbox: Sandbox) -> Self {
        Self::new(sandbox, Phase::Launched, Resources::new())
    }

    /// Leave the launching phase, handing back whatever queued up behind it.
    pub fn mark_launched(&mut self) -> VecDeque<Deferred> {
        match std::mem::replace(&mut self.phase, Phase::Launched) {
            Phase::Launching { deferred } => deferred,
            Phase::Launched => VecDeque::new(),
        }
    }

    pub fn observe_termination(&self) -> Observer<TerminationOutcome> {
        self.observer.clone()
    }

    /// Fulfil the termination signal. Returns false if it was already set.
    pub fn terminate(&mut self, outcome: TerminationOutcome) -> bool {
        match self.termination.take() {
            Some(promise) => {
                promise.fulfil(outcome);
                true
            }
            None => false,
        }
    }
}

/// Containers under management, keyed by id.
///
/// Owned by the containerizer actor; nothing else touches it.
#[derive(Default)]
pub(crate) struct Registry {
    containers: HashMap<ContainerId, Container>,
    next_generation: u64,
}

impl Registry {
    /// Insert a new record and return the generation stamped on it.
    pub fn insert(
        &mut self,
        id: ContainerId,
        mut container: Container,
    ) -> Result<u64, ContainerizerError> {
        if self.containers.contains_key(&id) {
            return Err(ContainerizerError::DuplicateContainer(id));
        }
        self.next_generation += 1;
        container.generation = self.next_generation;
        self.containers.insert(id, container);
        Ok(self.next_generation)
    }

    pub fn get(&self, id: &ContainerId) -> Option<&Container> {
        self.containers.get(id)
    }

    pub fn get_mut(&mut self, id: &ContainerId) -> Option<&mut Container> {
        self.containers.get_mut(id)
    }

    /// The record for `id`, only if it is still the one stamped `generation`.
    pub fn get_current(&mut self, id: &ContainerId, generation: u64) -> Option<&mut Container> {
        self.containers
            .get_mut(id)
            .filter(|container| container.generation == generation)
    }

    pub fn remove(&mut self, id: &ContainerId) -> Option<Container> {
        self.containers.remove(id)
    }

    pub fn ids(&self) -> HashSet<ContainerId> {
        self.containers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new("/tmp/c1", None)
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut registry = Registry::default();
        let id = ContainerId::new("c1");
        registry
            .insert(id.clone(), Container::recovered(sandbox()))
            .unwrap();
        let err = registry
            .insert(id.clone(), Container::recovered(sandbox()))
            .unwrap_err();
        assert_eq!(err, ContainerizerError::DuplicateContainer(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reinserted_ids_get_a_new_generation() {
        let mut registry = Registry::default();
        let id = ContainerId::new("c1");
        let first = registry
            .insert(id.clone(), Container::recovered(sandbox()))
            .unwrap();
        registry.remove(&id);
        let second = registry
            .insert(id.clone(), Container::recovered(sandbox()))
            .unwrap();

        assert_ne!(first, second);
        assert!(registry.get_current(&id, first).is_none());
        assert!(registry.get_current(&id, second).is_some());
    }

    #[test]
    fn ids_is_a_snapshot() {
        let mut registry = Registry::default();
        registry
            .insert("a".into(), Container::recovered(sandbox()))
            .unwrap();
        let ids = registry.ids();
        registry.remove(&"a".into());
        assert!(ids.contains(&ContainerId::new("a")));
        assert!(registry.get(&"a".into()).is_none());
    }

    #[test]
    fn recovered_containers_start_launched() {
        let mut container = Container::recovered(sandbox());
        assert!(matches!(container.phase, Phase::Launched));
        assert!(container.mark_launched().is_empty());
    }

    #[tokio::test]
    async fn termination_is_fulfilled_once() {
        let mut container = Container::launching(sandbox(), Resources::new());
        let observer = container.observe_termination();
        let first = Termination {
            killed: false,
            message: "exited".into(),
            status: Some(0),
        };

        assert!(container.terminate(Ok(first.clone())));
        assert!(!container.terminate(Err(ContainerizerError::Shutdown)));
        assert_eq!(observer.get().await, Some(Ok(first)));
    }
}
