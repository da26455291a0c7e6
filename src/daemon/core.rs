use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, trace, warn};

use super::barrier::{WorkBarrier, WorkGuard};
use super::command::{AdminCommand, AdminRequest, DaemonCommand, Params, Results, GET_STATE, STATE_KEY};
use super::policy::FailurePolicy;
use super::signals;
use super::state::DaemonState;
use super::tree::TreeSnapshot;
use crate::error::{DaemonError, HookStage, Result};

/// Default interval the run loop waits for a command before running a cycle.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

pub type InitializeFn = Arc<dyn Fn(&Daemon, &Params) -> anyhow::Result<()> + Send + Sync>;
pub type CleanupFn = Arc<dyn Fn(&Daemon, &Params) -> anyhow::Result<()> + Send + Sync>;
pub type CycleFn = Arc<dyn Fn(&Daemon) -> anyhow::Result<usize> + Send + Sync>;
pub type CommandFn = Arc<dyn Fn(&Daemon, &Params) -> anyhow::Result<Results> + Send + Sync>;

static NEXT_DAEMON_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Daemon whose run loop owns the current thread.
    static LOOP_DAEMON: Cell<Option<DaemonId>> = const { Cell::new(None) };
}

/// Process-unique daemon identity, used for child removal and cycle checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DaemonId(u64);

impl DaemonId {
    fn next() -> Self {
        DaemonId(NEXT_DAEMON_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

struct CommandEntry {
    command: DaemonCommand,
    /// `None` marks a removed handler; the key stays so forwarding is unaffected.
    handler: Option<CommandFn>,
}

struct Hooks {
    initialize: InitializeFn,
    cycle: CycleFn,
    cleanup: CleanupFn,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            initialize: Arc::new(|_, _| Ok(())),
            cycle: Arc::new(|_| Ok(0)),
            cleanup: Arc::new(|_, _| Ok(())),
        }
    }
}

struct ParentLink {
    id: DaemonId,
    barrier: Arc<WorkBarrier>,
}

struct Inner {
    id: DaemonId,
    name: String,
    poll_timeout: Duration,
    policy: FailurePolicy,
    state: RwLock<DaemonState>,
    hooks: RwLock<Hooks>,
    commands: RwLock<BTreeMap<String, CommandEntry>>,
    children: Mutex<Vec<Daemon>>,
    parent: Mutex<Option<ParentLink>>,
    local_barrier: Arc<WorkBarrier>,
    termination: Option<Arc<WorkBarrier>>,
    mailbox: Sender<AdminRequest>,
    inbox: Mutex<Option<Receiver<AdminRequest>>>,
    run_params: Mutex<Option<Params>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    alive: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Handle to a supervised daemon.
///
/// Each daemon owns one run-loop thread. Commands reach it through a
/// rendezvous mailbox; every request carries its own reply slot, so any number
/// of threads can call [`submit_command`](Daemon::submit_command) at once.
/// Cloning the handle is cheap and refers to the same daemon.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

/// Builder for a [`Daemon`] with non-default settings or hooks.
pub struct DaemonBuilder {
    name: String,
    poll_timeout: Duration,
    policy: FailurePolicy,
    hooks: Hooks,
    termination: Option<Arc<WorkBarrier>>,
}

impl DaemonBuilder {
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn initialize<F>(mut self, f: F) -> Self
    where
        F: Fn(&Daemon, &Params) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.initialize = Arc::new(f);
        self
    }

    pub fn one_cycle<F>(mut self, f: F) -> Self
    where
        F: Fn(&Daemon) -> anyhow::Result<usize> + Send + Sync + 'static,
    {
        self.hooks.cycle = Arc::new(f);
        self
    }

    pub fn cleanup<F>(mut self, f: F) -> Self
    where
        F: Fn(&Daemon, &Params) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.cleanup = Arc::new(f);
        self
    }

    /// Make this daemon a root: it holds `barrier` until its cleanup has run
    /// and ends itself on SIGTERM/SIGINT.
    pub fn termination_barrier(mut self, barrier: Arc<WorkBarrier>) -> Self {
        self.termination = Some(barrier);
        self
    }

    pub fn build(self) -> Daemon {
        let (mailbox, inbox) = crossbeam_channel::bounded(0);
        let daemon = Daemon {
            inner: Arc::new(Inner {
                id: DaemonId::next(),
                name: self.name,
                poll_timeout: self.poll_timeout,
                policy: self.policy,
                state: RwLock::new(DaemonState::INITIAL),
                hooks: RwLock::new(self.hooks),
                commands: RwLock::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
                parent: Mutex::new(None),
                local_barrier: Arc::new(WorkBarrier::new()),
                termination: self.termination,
                mailbox,
                inbox: Mutex::new(Some(inbox)),
                run_params: Mutex::new(None),
                thread: Mutex::new(None),
                started: AtomicBool::new(false),
                alive: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
        };
        daemon.install_standard_commands();
        daemon
    }
}

/// Outcome of one `accept_command` pass.
enum Flow {
    Continue,
    /// Fatal failure under [`FailurePolicy::Crash`]; leave without cleanup.
    Abort,
}

impl Daemon {
    /// Daemon with default no-op hooks, standard commands and a 1000 ms poll timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> DaemonBuilder {
        DaemonBuilder {
            name: name.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            policy: FailurePolicy::default(),
            hooks: Hooks::default(),
            termination: None,
        }
    }

    pub fn id(&self) -> DaemonId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn poll_timeout(&self) -> Duration {
        self.inner.poll_timeout
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.inner.policy
    }

    pub fn get_state(&self) -> DaemonState {
        *read(&self.inner.state)
    }

    /// Whether the run loop thread is currently executing.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_root(&self) -> bool {
        self.inner.termination.is_some()
    }

    /// The failure that ended or crashed the run loop, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn children(&self) -> Vec<Daemon> {
        lock(&self.inner.children).clone()
    }

    pub fn set_initialize_fxn<F>(&self, f: F)
    where
        F: Fn(&Daemon, &Params) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.inner.hooks).initialize = Arc::new(f);
    }

    pub fn set_one_cycle_fxn<F>(&self, f: F)
    where
        F: Fn(&Daemon) -> anyhow::Result<usize> + Send + Sync + 'static,
    {
        write(&self.inner.hooks).cycle = Arc::new(f);
    }

    pub fn set_cleanup_fxn<F>(&self, f: F)
    where
        F: Fn(&Daemon, &Params) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.inner.hooks).cleanup = Arc::new(f);
    }

    /// Register (or replace) the handler for `command`.
    pub fn add_command_fxn<F>(&self, command: DaemonCommand, handler: F)
    where
        F: Fn(&Daemon, &Params) -> anyhow::Result<Results> + Send + Sync + 'static,
    {
        let name = command.command_name().to_string();
        write(&self.inner.commands).insert(
            name,
            CommandEntry {
                command,
                handler: Some(Arc::new(handler)),
            },
        );
    }

    /// Clear the handler for `command`. The command stays known to this
    /// daemon and is still forwarded to children.
    pub fn remove_command_fxn(&self, command: &DaemonCommand) {
        let mut commands = write(&self.inner.commands);
        match commands.get_mut(command.command_name()) {
            Some(entry) => entry.handler = None,
            None => {
                commands.insert(
                    command.command_name().to_string(),
                    CommandEntry {
                        command: command.clone(),
                        handler: None,
                    },
                );
            }
        }
    }

    /// Commands known to this daemon and, recursively, to all of its children.
    pub fn get_commands(&self) -> BTreeMap<String, DaemonCommand> {
        let mut table: BTreeMap<String, DaemonCommand> = read(&self.inner.commands)
            .iter()
            .map(|(name, entry)| (name.clone(), entry.command.clone()))
            .collect();
        for child in self.children() {
            for (name, command) in child.get_commands() {
                table.entry(name).or_insert(command);
            }
        }
        table
    }

    /// Attach `child` below this daemon.
    ///
    /// If this daemon is already running, the child is started with the same
    /// params this daemon was started with.
    pub fn add_daemon_child(&self, child: Daemon) -> Result<()> {
        if child.id() == self.id() || TreeSnapshot::capture(&child).contains(self.id()) {
            return Err(DaemonError::CycleDetected {
                parent: self.name().to_string(),
                child: child.name().to_string(),
            });
        }

        if self.children().iter().any(|c| c.name() == child.name()) {
            return Err(DaemonError::DuplicateChild {
                parent: self.name().to_string(),
                child: child.name().to_string(),
            });
        }

        {
            let mut parent = lock(&child.inner.parent);
            if parent.is_some() {
                return Err(DaemonError::AlreadyParented {
                    child: child.name().to_string(),
                });
            }
            *parent = Some(ParentLink {
                id: self.id(),
                barrier: Arc::clone(&self.inner.local_barrier),
            });
        }

        debug!(daemon = %self.name(), child = %child.name(), "child attached");
        lock(&self.inner.children).push(child.clone());

        let params = lock(&self.inner.run_params).clone();
        if let Some(params) = params {
            if self.is_alive() && !child.is_started() {
                child.run(params)?;
            }
        }
        Ok(())
    }

    /// End `child` and detach it. Returns false if it was not a child of this daemon.
    pub fn remove_daemon_child(&self, child: &Daemon) -> bool {
        let known = self.children().iter().any(|c| c.id() == child.id());
        if !known {
            return false;
        }

        if let Err(e) = child.submit_command(DaemonCommand::end(), Params::new()) {
            warn!(
                daemon = %self.name(),
                child = %child.name(),
                error = %e,
                "child did not acknowledge End cleanly"
            );
        }
        child.join();

        lock(&self.inner.children).retain(|c| c.id() != child.id());
        *lock(&child.inner.parent) = None;
        debug!(daemon = %self.name(), child = %child.name(), "child detached");
        true
    }

    /// Id of the daemon this one is attached to.
    pub fn parent_id(&self) -> Option<DaemonId> {
        lock(&self.inner.parent).as_ref().map(|link| link.id)
    }

    /// Register outstanding work against the parent's barrier.
    ///
    /// The parent will not finish forwarding a command to its children until
    /// the returned guard has been dropped. `None` when there is no parent.
    pub fn register_outstanding_work(&self) -> Option<WorkGuard> {
        self.parent_barrier().map(|barrier| barrier.enter())
    }

    /// Outstanding work registered by this daemon's children.
    pub fn outstanding_child_work(&self) -> usize {
        self.inner.local_barrier.outstanding()
    }

    /// Start the run loop on its own thread.
    pub fn run(&self, params: Params) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DaemonError::AlreadyStarted {
                daemon: self.name().to_string(),
            });
        }
        let inbox = lock(&self.inner.inbox)
            .take()
            .ok_or_else(|| DaemonError::AlreadyStarted {
                daemon: self.name().to_string(),
            })?;

        *lock(&self.inner.run_params) = Some(params.clone());
        self.inner.alive.store(true, Ordering::SeqCst);

        let exit = LoopExit {
            daemon: self.clone(),
            _termination: self.inner.termination.as_ref().map(|b| b.enter()),
        };
        let spawned = thread::Builder::new()
            .name(format!("daemon-{}", self.name()))
            .spawn(move || {
                let exit = exit;
                exit.daemon.run_loop(inbox, params);
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.inner.thread) = Some(handle);
                Ok(())
            }
            Err(source) => Err(DaemonError::Spawn {
                daemon: self.name().to_string(),
                source,
            }),
        }
    }

    /// Wait for the run loop thread to exit. No-op from the loop itself or
    /// when the daemon never started.
    pub fn join(&self) {
        if self.is_loop_thread() {
            return;
        }
        let handle = lock(&self.inner.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(daemon = %self.name(), "run loop panicked");
            }
        }
    }

    /// Execute `command` on this daemon and every daemon below it.
    ///
    /// Blocks until the run loop has handled the command, forwarded it to all
    /// children and applied the target state. Calls made from the run loop of
    /// this daemon or of any daemon below it fail with `Reentrant`: forwarding
    /// would wait on the caller's own loop.
    pub fn submit_command(&self, command: DaemonCommand, params: Params) -> Result<Results> {
        if LOOP_DAEMON.with(Cell::get).is_some_and(|caller| self.in_subtree(caller)) {
            return Err(DaemonError::Reentrant {
                daemon: self.name().to_string(),
            });
        }
        if self.get_state().is_terminal_state() {
            return self.answer_terminal(&command);
        }
        if !self.is_started() {
            return Err(DaemonError::NotRunning {
                daemon: self.name().to_string(),
            });
        }

        let (request, reply) = AdminRequest::new(AdminCommand::new(command, params));
        if let Err(unsent) = self.inner.mailbox.send(request) {
            if self.get_state().is_terminal_state() {
                return self.answer_terminal(&unsent.0.command.command);
            }
            return Err(DaemonError::Disconnected {
                daemon: self.name().to_string(),
            });
        }

        match reply.recv() {
            Ok(admin) => admin.into_outcome(),
            Err(_) => Err(DaemonError::Disconnected {
                daemon: self.name().to_string(),
            }),
        }
    }

    fn install_standard_commands(&self) {
        let [run, pause, end, get_state] = DaemonCommand::standard();
        self.add_command_fxn(run, |_, _| Ok(Results::new()));
        self.add_command_fxn(pause, |_, _| Ok(Results::new()));
        self.add_command_fxn(end, |_, _| Ok(Results::new()));
        self.add_command_fxn(get_state, |daemon, _| {
            let mut results = Results::new();
            results.insert(STATE_KEY.to_string(), daemon.get_state().state_name().into());
            Ok(results)
        });
    }

    // Ended daemons still answer queries and a repeated End.
    fn answer_terminal(&self, command: &DaemonCommand) -> Result<Results> {
        let state = self.get_state();
        if command.command_name() == GET_STATE {
            let mut results = Results::new();
            results.insert(STATE_KEY.to_string(), state.state_name().into());
            return Ok(results);
        }
        match command.target_state() {
            Ok(target) if target == state => Ok(Results::new()),
            _ => Err(DaemonError::Terminated {
                daemon: self.name().to_string(),
                command: command.command_name().to_string(),
            }),
        }
    }

    fn run_loop(&self, inbox: Receiver<AdminRequest>, params: Params) {
        LOOP_DAEMON.with(|current| current.set(Some(self.id())));
        let watcher = if self.is_root() {
            signals::spawn_watcher(self)
        } else {
            None
        };

        let initialize = Arc::clone(&read(&self.inner.hooks).initialize);
        if let Err(source) = initialize(self, &params) {
            self.record_failure(DaemonError::Hook {
                daemon: self.name().to_string(),
                stage: HookStage::Initialize,
                source,
            });
            return;
        }
        info!(daemon = %self.name(), "daemon initialized");

        for child in self.children() {
            if child.is_started() {
                continue;
            }
            if let Err(e) = child.run(params.clone()) {
                warn!(daemon = %self.name(), child = %child.name(), error = %e, "failed to start child");
            }
        }

        loop {
            if let Flow::Abort = self.accept_command(&inbox) {
                return;
            }

            let state = self.get_state();
            if state.is_terminal_state() {
                break;
            }
            if !state.can_execute_cycles() {
                continue;
            }

            let cycle = Arc::clone(&read(&self.inner.hooks).cycle);
            match cycle(self) {
                Ok(0) => {}
                Ok(items) => trace!(daemon = %self.name(), items, "cycle processed items"),
                Err(source) => {
                    let err = DaemonError::Hook {
                        daemon: self.name().to_string(),
                        stage: HookStage::Cycle,
                        source,
                    };
                    if self.inner.policy.is_fatal() {
                        self.record_failure(err);
                        return;
                    }
                    warn!(daemon = %self.name(), error = %err, "cycle failed, continuing");
                }
            }
        }

        drop(inbox);
        if let Some(watcher) = watcher {
            watcher.shutdown();
        }
        let cleanup = Arc::clone(&read(&self.inner.hooks).cleanup);
        if let Err(source) = cleanup(self, &params) {
            self.record_failure(DaemonError::Hook {
                daemon: self.name().to_string(),
                stage: HookStage::Cleanup,
                source,
            });
            return;
        }
        info!(daemon = %self.name(), "daemon stopped");
    }

    fn accept_command(&self, inbox: &Receiver<AdminRequest>) -> Flow {
        let request = match inbox.recv_timeout(self.inner.poll_timeout) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                trace!(daemon = %self.name(), "no command before poll timeout");
                return Flow::Continue;
            }
        };

        let _parent_work = self.register_outstanding_work();
        let AdminRequest { mut command, reply } = request;
        let name = command.command.command_name().to_string();
        debug!(daemon = %self.name(), command = %name, "command accepted");

        let handler = read(&self.inner.commands)
            .get(&name)
            .and_then(|entry| entry.handler.clone());
        match handler {
            Some(handler) => match handler(self, &command.params) {
                Ok(results) => command.results.extend(results),
                Err(source) => {
                    let err = DaemonError::Handler {
                        daemon: self.name().to_string(),
                        command: name,
                        source,
                    };
                    return self.fail_command(command, reply, err);
                }
            },
            None => trace!(daemon = %self.name(), command = %name, "no handler registered"),
        }

        let children = self.children();
        let mut child_failure = None;
        for child in &children {
            match child.submit_command(command.command.clone(), command.params.clone()) {
                Ok(results) if results.is_empty() => {}
                Ok(results) => match command.results.entry(child.name().to_string()) {
                    Entry::Vacant(slot) => {
                        slot.insert(serde_json::Value::Object(results.into_iter().collect()));
                    }
                    Entry::Occupied(_) => warn!(
                        daemon = %self.name(),
                        child = %child.name(),
                        command = %name,
                        "child results dropped, key already present"
                    ),
                },
                Err(source) => {
                    let err = DaemonError::Child {
                        child: child.name().to_string(),
                        command: name.clone(),
                        source: Box::new(source),
                    };
                    if self.inner.policy.is_fatal() {
                        return self.fail_command(command, reply, err);
                    }
                    warn!(daemon = %self.name(), error = %err, "child failed, continuing");
                    child_failure.get_or_insert(err);
                }
            }
        }
        if !children.is_empty() {
            self.inner.local_barrier.wait();
        }

        if let Ok(target) = command.command.target_state() {
            if target.is_terminal_state() {
                for child in &children {
                    child.join();
                }
            }
            let previous = std::mem::replace(&mut *write(&self.inner.state), target);
            if previous != target {
                info!(daemon = %self.name(), from = %previous, to = %target, "state changed");
            }
        }

        command.err = child_failure;
        if reply.send(command).is_err() {
            debug!(daemon = %self.name(), command = %name, "submitter went away before reply");
        }
        Flow::Continue
    }

    fn fail_command(&self, mut command: AdminCommand, reply: Sender<AdminCommand>, err: DaemonError) -> Flow {
        let flow = if self.inner.policy.is_fatal() {
            error!(daemon = %self.name(), error = %err, "command failed, terminating run loop");
            *lock(&self.inner.last_error) = Some(err.to_string());
            Flow::Abort
        } else {
            warn!(daemon = %self.name(), error = %err, "command failed");
            Flow::Continue
        };
        command.err = Some(err);
        let _ = reply.send(command);
        flow
    }

    fn record_failure(&self, err: DaemonError) {
        error!(daemon = %self.name(), error = %err, "run loop terminated");
        *lock(&self.inner.last_error) = Some(err.to_string());
    }

    fn parent_barrier(&self) -> Option<Arc<WorkBarrier>> {
        lock(&self.inner.parent)
            .as_ref()
            .map(|link| Arc::clone(&link.barrier))
    }

    fn is_loop_thread(&self) -> bool {
        LOOP_DAEMON.with(Cell::get) == Some(self.id())
    }

    fn in_subtree(&self, id: DaemonId) -> bool {
        self.id() == id || self.children().iter().any(|child| child.in_subtree(id))
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.get_state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Marks the run loop dead on any exit, including unwinding out of a hook.
/// The termination guard is released only after the flag flips.
struct LoopExit {
    daemon: Daemon,
    _termination: Option<WorkGuard>,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut last_error = lock(&self.daemon.inner.last_error);
            last_error.get_or_insert_with(|| "run loop panicked".to_string());
        }
        self.daemon.inner.alive.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::command::{END, RUN};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn fast(name: &str) -> DaemonBuilder {
        Daemon::builder(name).poll_timeout(Duration::from_millis(10))
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn counting_cycle(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(&Daemon) -> anyhow::Result<usize> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[test]
    fn new_daemon_is_initial() {
        let daemon = Daemon::new("edge");
        assert_eq!(daemon.get_state(), DaemonState::INITIAL);
        assert!(!daemon.get_state().is_terminal_state());
        assert_eq!(daemon.poll_timeout(), DEFAULT_POLL_TIMEOUT);
        assert!(!daemon.is_alive());
    }

    #[test]
    fn run_get_state_end_scenario() {
        let daemon = Daemon::new("edge");
        daemon.run(Params::new()).unwrap();

        let results = daemon.submit_command(DaemonCommand::run(), Params::new()).unwrap();
        assert!(results.is_empty());
        assert_eq!(daemon.get_state().state_name(), "RUNNING");
        assert!(daemon.get_state().can_execute_cycles());

        let results = daemon
            .submit_command(DaemonCommand::get_state(), Params::new())
            .unwrap();
        assert_eq!(results[STATE_KEY], "RUNNING");

        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        assert_eq!(daemon.get_state().state_name(), "ENDED");
        daemon.join();
        assert!(!daemon.is_alive());
        assert!(daemon.last_error().is_none());
    }

    #[test]
    fn pause_stops_cycles() {
        let counter = Arc::new(AtomicUsize::new(0));
        let daemon = fast("sampler").one_cycle(counting_cycle(&counter)).build();
        daemon.run(Params::new()).unwrap();

        daemon.submit_command(DaemonCommand::run(), Params::new()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) >= 3));

        daemon.submit_command(DaemonCommand::pause(), Params::new()).unwrap();
        assert_eq!(daemon.get_state(), DaemonState::PAUSED);
        assert!(!daemon.get_state().can_execute_cycles());
        let paused_at = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), paused_at);

        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn zero_item_cycles_keep_running() {
        let counter = Arc::new(AtomicUsize::new(0));
        let daemon = fast("idle").one_cycle(counting_cycle(&counter)).build();
        daemon.run(Params::new()).unwrap();
        daemon.submit_command(DaemonCommand::run(), Params::new()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) >= 5));
        assert!(daemon.is_alive());
        assert!(daemon.last_error().is_none());

        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn end_is_idempotent() {
        let daemon = fast("edge").build();
        daemon.run(Params::new()).unwrap();
        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();

        let again = daemon.submit_command(DaemonCommand::end(), Params::new());
        assert!(again.unwrap().is_empty());
        assert!(daemon.get_state().is_terminal_state());

        let state = daemon
            .submit_command(DaemonCommand::get_state(), Params::new())
            .unwrap();
        assert_eq!(state[STATE_KEY], "ENDED");

        let err = daemon
            .submit_command(DaemonCommand::run(), Params::new())
            .unwrap_err();
        assert!(matches!(err, DaemonError::Terminated { .. }));
        assert_eq!(daemon.get_state(), DaemonState::ENDED);
    }

    #[test]
    fn concurrent_submitters_get_their_own_replies() {
        let daemon = fast("edge").build();
        daemon.add_command_fxn(DaemonCommand::new("Echo").inputs(["token"]), |_, params| {
            Ok(params.clone())
        });
        daemon.run(Params::new()).unwrap();

        let workers: Vec<_> = (0..16)
            .map(|i| {
                let daemon = daemon.clone();
                thread::spawn(move || {
                    let mut params = Params::new();
                    params.insert("token".into(), i.into());
                    let results = daemon
                        .submit_command(DaemonCommand::new("Echo"), params)
                        .unwrap();
                    (i, results["token"].as_i64().unwrap())
                })
            })
            .collect();

        for worker in workers {
            let (sent, received) = worker.join().unwrap();
            assert_eq!(sent as i64, received);
        }

        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn submit_before_run_is_rejected() {
        let daemon = Daemon::new("edge");
        let err = daemon
            .submit_command(DaemonCommand::run(), Params::new())
            .unwrap_err();
        assert!(matches!(err, DaemonError::NotRunning { .. }));
        assert!(err.is_unavailable());
    }

    #[test]
    fn run_twice_is_rejected() {
        let daemon = fast("edge").build();
        daemon.run(Params::new()).unwrap();
        assert!(matches!(
            daemon.run(Params::new()),
            Err(DaemonError::AlreadyStarted { .. })
        ));
        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn child_sees_command_before_parent_returns() {
        let parent = fast("edge").build();
        let child = fast("mqtt").build();
        parent.add_daemon_child(child.clone()).unwrap();
        parent.run(Params::new()).unwrap();

        parent.submit_command(DaemonCommand::run(), Params::new()).unwrap();
        assert_eq!(child.get_state(), DaemonState::RUNNING);

        parent.submit_command(DaemonCommand::pause(), Params::new()).unwrap();
        assert_eq!(child.get_state(), DaemonState::PAUSED);

        let results = parent
            .submit_command(DaemonCommand::get_state(), Params::new())
            .unwrap();
        assert_eq!(results[STATE_KEY], "PAUSED");
        assert_eq!(results["mqtt"][STATE_KEY], "PAUSED");

        parent.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        assert_eq!(child.get_state(), DaemonState::ENDED);
        assert!(!child.is_alive());
        parent.join();
    }

    #[test]
    fn get_commands_merges_children() {
        let parent = Daemon::new("edge");
        let a = Daemon::new("mqtt");
        let b = Daemon::new("calendar");
        a.add_command_fxn(DaemonCommand::new("Publish").inputs(["topic"]), |_, _| Ok(Results::new()));
        b.add_command_fxn(DaemonCommand::new("GetShift"), |_, _| Ok(Results::new()));
        parent.add_daemon_child(a).unwrap();
        parent.add_daemon_child(b).unwrap();

        let names: Vec<String> = parent.get_commands().into_keys().collect();
        assert_eq!(
            names,
            vec!["End", "GetShift", "GetState", "Pause", "Publish", "Run"]
        );
        assert_eq!(
            parent.get_commands()["Publish"].input_param_names(),
            ["topic".to_string()]
        );
    }

    #[test]
    fn removed_handler_still_forwards_and_transitions() {
        let parent = fast("edge").build();
        let child = fast("opcua").build();
        let child_runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&child_runs);
        child.add_command_fxn(DaemonCommand::run(), move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Results::new())
        });
        parent.remove_command_fxn(&DaemonCommand::run());
        parent.add_daemon_child(child.clone()).unwrap();
        parent.run(Params::new()).unwrap();

        parent.submit_command(DaemonCommand::run(), Params::new()).unwrap();
        assert_eq!(parent.get_state(), DaemonState::RUNNING);
        assert_eq!(child.get_state(), DaemonState::RUNNING);
        assert_eq!(child_runs.load(Ordering::SeqCst), 1);
        assert!(parent.get_commands().contains_key(RUN));

        parent.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        parent.join();
    }

    #[test]
    fn unknown_command_is_not_an_error() {
        let daemon = fast("edge").build();
        daemon.run(Params::new()).unwrap();
        let stop = DaemonCommand::new("Hold").target(DaemonState::PAUSED);
        let results = daemon.submit_command(stop, Params::new()).unwrap();
        assert!(results.is_empty());
        assert_eq!(daemon.get_state(), DaemonState::PAUSED);
        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn cycle_error_crashes_daemon() {
        let daemon = fast("opcua")
            .one_cycle(|_| anyhow::bail!("session lost"))
            .build();
        daemon.run(Params::new()).unwrap();
        daemon.submit_command(DaemonCommand::run(), Params::new()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !daemon.is_alive()));
        assert!(daemon.last_error().unwrap().contains("session lost"));
        assert_eq!(daemon.get_state(), DaemonState::RUNNING);

        let err = daemon
            .submit_command(DaemonCommand::get_state(), Params::new())
            .unwrap_err();
        assert!(matches!(err, DaemonError::Disconnected { .. }));
    }

    #[test]
    fn cycle_error_is_reported_under_report_policy() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let daemon = fast("opcua")
            .failure_policy(FailurePolicy::Report)
            .one_cycle(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("read timeout")
            })
            .build();
        daemon.run(Params::new()).unwrap();
        daemon.submit_command(DaemonCommand::run(), Params::new()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) >= 3));
        assert!(daemon.is_alive());
        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn handler_error_crashes_under_default_policy() {
        let daemon = fast("calendar").build();
        daemon.add_command_fxn(DaemonCommand::new("Reload"), |_, _| anyhow::bail!("bad shift table"));
        daemon.run(Params::new()).unwrap();

        let err = daemon
            .submit_command(DaemonCommand::new("Reload"), Params::new())
            .unwrap_err();
        assert!(matches!(err, DaemonError::Handler { .. }));
        assert!(wait_until(Duration::from_secs(2), || !daemon.is_alive()));
        assert!(daemon.last_error().is_some());
    }

    #[test]
    fn handler_error_keeps_daemon_under_report_policy() {
        let daemon = fast("calendar")
            .failure_policy(FailurePolicy::Report)
            .build();
        daemon.add_command_fxn(
            DaemonCommand::new("Hold").target(DaemonState::PAUSED),
            |_, _| anyhow::bail!("not now"),
        );
        daemon.run(Params::new()).unwrap();
        daemon.submit_command(DaemonCommand::run(), Params::new()).unwrap();

        let err = daemon
            .submit_command(DaemonCommand::new("Hold").target(DaemonState::PAUSED), Params::new())
            .unwrap_err();
        assert!(err.to_string().contains("not now"));
        assert!(daemon.is_alive());
        assert_eq!(daemon.get_state(), DaemonState::RUNNING);

        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn failed_child_is_reported_and_parent_still_ends() {
        let parent = fast("edge").failure_policy(FailurePolicy::Report).build();
        let child = fast("nats").one_cycle(|_| anyhow::bail!("broker gone")).build();
        parent.add_daemon_child(child.clone()).unwrap();
        parent.run(Params::new()).unwrap();
        parent.submit_command(DaemonCommand::run(), Params::new()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || !child.is_alive()));

        let err = parent
            .submit_command(DaemonCommand::end(), Params::new())
            .unwrap_err();
        assert!(matches!(err, DaemonError::Child { ref child, .. } if child == "nats"));
        assert_eq!(parent.get_state(), DaemonState::ENDED);
        parent.join();
    }

    #[test]
    fn reentrant_submit_is_rejected() {
        let daemon = fast("edge").build();
        daemon.add_command_fxn(DaemonCommand::new("Loop"), |daemon, _| {
            let nested = daemon.submit_command(DaemonCommand::get_state(), Params::new());
            let mut results = Results::new();
            results.insert(
                "reentrant".into(),
                matches!(nested, Err(DaemonError::Reentrant { .. })).into(),
            );
            Ok(results)
        });
        daemon.run(Params::new()).unwrap();

        let results = daemon
            .submit_command(DaemonCommand::new("Loop"), Params::new())
            .unwrap();
        assert_eq!(results["reentrant"], true);
        daemon.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        daemon.join();
    }

    #[test]
    fn descendant_submitting_to_ancestor_is_rejected() {
        let root = fast("edge").build();
        let connector = fast("connector").build();
        let mqtt = fast("mqtt").build();
        let ancestor = root.clone();
        mqtt.add_command_fxn(DaemonCommand::new("Escalate"), move |_, _| {
            let nested = ancestor.submit_command(DaemonCommand::get_state(), Params::new());
            let mut results = Results::new();
            results.insert(
                "reentrant".into(),
                matches!(nested, Err(DaemonError::Reentrant { .. })).into(),
            );
            Ok(results)
        });
        connector.add_daemon_child(mqtt).unwrap();
        root.add_daemon_child(connector).unwrap();
        root.run(Params::new()).unwrap();

        let remote = root.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = done_tx.send(remote.submit_command(DaemonCommand::new("Escalate"), Params::new()));
        });
        let results = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("submit to ancestor must not block")
            .unwrap();
        assert_eq!(results["connector"]["mqtt"]["reentrant"], true);

        root.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        root.join();
    }

    #[test]
    fn handler_may_submit_to_its_children() {
        let root = fast("edge").build();
        let mqtt = fast("mqtt").build();
        root.add_daemon_child(mqtt.clone()).unwrap();
        root.add_command_fxn(DaemonCommand::new("Inspect"), move |_, _| {
            let child_state = mqtt.submit_command(DaemonCommand::get_state(), Params::new())?;
            let mut results = Results::new();
            results.insert("mqtt_state".into(), child_state[STATE_KEY].clone());
            Ok(results)
        });
        root.run(Params::new()).unwrap();

        let results = root
            .submit_command(DaemonCommand::new("Inspect"), Params::new())
            .unwrap();
        assert_eq!(results["mqtt_state"], "INITIAL");
        root.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        root.join();
    }

    #[test]
    fn sibling_names_must_be_unique() {
        let root = Daemon::new("edge");
        root.add_daemon_child(Daemon::new("hb")).unwrap();
        let clash = Daemon::new("hb");

        assert!(matches!(
            root.add_daemon_child(clash.clone()),
            Err(DaemonError::DuplicateChild { .. })
        ));
        assert_eq!(root.children().len(), 1);
        assert!(clash.parent_id().is_none());
    }

    #[test]
    fn child_results_never_overwrite_parent_keys() {
        let root = fast("edge").build();
        root.add_daemon_child(fast(STATE_KEY).build()).unwrap();
        root.run(Params::new()).unwrap();

        let results = root
            .submit_command(DaemonCommand::get_state(), Params::new())
            .unwrap();
        assert_eq!(results[STATE_KEY], "INITIAL");
        root.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        root.join();
    }

    #[test]
    fn initialize_error_stops_before_children() {
        let parent = fast("edge")
            .initialize(|_, _| anyhow::bail!("config missing"))
            .build();
        let child = fast("mqtt").build();
        parent.add_daemon_child(child.clone()).unwrap();
        parent.run(Params::new()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !parent.is_alive()));
        assert!(parent.last_error().unwrap().contains("initialize"));
        assert!(!child.is_started());
    }

    #[test]
    fn params_reach_hooks_and_children() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = |seen: &Arc<Mutex<Vec<String>>>| {
            let seen = Arc::clone(seen);
            move |daemon: &Daemon, params: &Params| {
                let site = params["site"].as_str().unwrap_or_default().to_string();
                lock(&seen).push(format!("{}@{}", daemon.name(), site));
                Ok::<(), anyhow::Error>(())
            }
        };
        let parent = fast("edge").initialize(record(&seen)).build();
        let child = fast("calendar").initialize(record(&seen)).build();
        parent.add_daemon_child(child.clone()).unwrap();

        let mut params = Params::new();
        params.insert("site".into(), "plant-7".into());
        parent.run(params).unwrap();
        assert!(wait_until(Duration::from_secs(2), || lock(&seen).len() == 2));
        assert_eq!(*lock(&seen), vec!["edge@plant-7", "calendar@plant-7"]);

        parent.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        parent.join();
    }

    #[test]
    fn cleanup_runs_leaves_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |order: &Arc<Mutex<Vec<String>>>| {
            let order = Arc::clone(order);
            move |daemon: &Daemon, _: &Params| {
                lock(&order).push(daemon.name().to_string());
                Ok::<(), anyhow::Error>(())
            }
        };
        let root = fast("edge").cleanup(record(&order)).build();
        let connector = fast("connector").cleanup(record(&order)).build();
        let mqtt = fast("mqtt").cleanup(record(&order)).build();
        connector.add_daemon_child(mqtt).unwrap();
        root.add_daemon_child(connector).unwrap();
        root.run(Params::new()).unwrap();

        root.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        root.join();
        assert_eq!(*lock(&order), vec!["mqtt", "connector", "edge"]);
    }

    #[test]
    fn child_added_to_running_parent_is_started() {
        let parent = fast("edge").build();
        parent.run(Params::new()).unwrap();
        parent.submit_command(DaemonCommand::run(), Params::new()).unwrap();

        let child = fast("graphql").build();
        parent.add_daemon_child(child.clone()).unwrap();
        assert!(child.is_started());

        parent.submit_command(DaemonCommand::run(), Params::new()).unwrap();
        assert_eq!(child.get_state(), DaemonState::RUNNING);

        parent.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        parent.join();
    }

    #[test]
    fn remove_child_ends_and_detaches_it() {
        let parent = fast("edge").build();
        let child = fast("nats").build();
        parent.add_daemon_child(child.clone()).unwrap();
        parent.run(Params::new()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || child.is_alive()));

        assert!(parent.remove_daemon_child(&child));
        assert_eq!(child.get_state(), DaemonState::ENDED);
        assert!(!child.is_alive());
        assert!(parent.children().is_empty());
        assert!(child.parent_id().is_none());
        assert!(!parent.remove_daemon_child(&child));

        parent.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        parent.join();
    }

    #[test]
    fn cycles_and_double_parents_are_rejected() {
        let root = Daemon::new("edge");
        let mid = Daemon::new("connector");
        let leaf = Daemon::new("mqtt");
        root.add_daemon_child(mid.clone()).unwrap();
        mid.add_daemon_child(leaf.clone()).unwrap();

        assert!(matches!(
            root.add_daemon_child(root.clone()),
            Err(DaemonError::CycleDetected { .. })
        ));
        assert!(matches!(
            leaf.add_daemon_child(root.clone()),
            Err(DaemonError::CycleDetected { .. })
        ));
        assert!(matches!(
            root.add_daemon_child(leaf.clone()),
            Err(DaemonError::AlreadyParented { .. })
        ));
        assert_eq!(leaf.parent_id(), Some(mid.id()));
    }

    #[test]
    fn parent_waits_for_outstanding_child_work() {
        let held: Arc<Mutex<Option<WorkGuard>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&held);
        let parent = fast("edge").build();
        let child = fast("sampler")
            .one_cycle(move |daemon| {
                let mut slot = lock(&slot);
                if slot.is_none() {
                    *slot = daemon.register_outstanding_work();
                }
                Ok(0)
            })
            .build();
        parent.add_daemon_child(child).unwrap();
        parent.run(Params::new()).unwrap();
        parent.submit_command(DaemonCommand::run(), Params::new()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || parent.outstanding_child_work() == 1));

        let release = Arc::clone(&held);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            lock(&release).take();
        });

        let started = Instant::now();
        parent
            .submit_command(DaemonCommand::pause(), Params::new())
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(parent.outstanding_child_work(), 0);
        releaser.join().unwrap();

        parent.submit_command(DaemonCommand::end(), Params::new()).unwrap();
        parent.join();
    }

    #[test]
    fn ended_root_stops_its_signal_watcher() {
        let barrier = Arc::new(WorkBarrier::new());
        let root = fast("edge")
            .termination_barrier(Arc::clone(&barrier))
            .build();
        root.run(Params::new()).unwrap();
        // run loop + signal watcher each hold a handle
        assert!(wait_until(Duration::from_secs(2), || Arc::strong_count(&root.inner) >= 3));

        let remote = root.clone();
        thread::spawn(move || remote.submit_command(DaemonCommand::end(), Params::new()))
            .join()
            .unwrap()
            .unwrap();
        root.join();

        assert_eq!(Arc::strong_count(&root.inner), 1);
        assert!(barrier.wait_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn root_releases_termination_barrier_after_cleanup() {
        let barrier = Arc::new(WorkBarrier::new());
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        let root = fast("edge")
            .termination_barrier(Arc::clone(&barrier))
            .cleanup(move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build();
        assert!(root.is_root());
        root.run(Params::new()).unwrap();
        assert_eq!(barrier.outstanding(), 1);

        let remote = root.clone();
        thread::spawn(move || remote.submit_command(DaemonCommand::end(), Params::new()))
            .join()
            .unwrap()
            .unwrap();
        assert!(barrier.wait_timeout(Duration::from_secs(2)));
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(!root.is_alive());
        assert!(root.get_commands().contains_key(END));
    }
}
