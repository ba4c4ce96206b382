use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, Sender};
use mio::{Events, Poll, Token, Waker};

use crate::task::{Context, Readiness, Status, Task, TaskError, TaskId};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

const WAKER_TOKEN: Token = Token(0);

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound for a single blocking poll.
    pub poll_timeout: Duration,
    /// Readiness events fetched per poll.
    pub event_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Requests queued by tasks during a cycle, applied by the reactor between
/// cycles.
#[derive(Default)]
pub(crate) struct Pending {
    pub(crate) spawned: Vec<(TaskId, Box<dyn Task>)>,
    pub(crate) cancelled: Vec<TaskId>,
    pub(crate) woken: Vec<TaskId>,
}

impl Pending {
    fn is_idle(&self) -> bool {
        self.spawned.is_empty() && self.cancelled.is_empty() && self.woken.is_empty()
    }
}

enum Command {
    Spawn(TaskId, Box<dyn Task>),
    Cancel(TaskId),
    Wake(TaskId),
    Shutdown,
}

#[derive(Debug)]
struct TokenGenerator {
    next_token: AtomicUsize,
}

impl TokenGenerator {
    fn new() -> Self {
        Self {
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
        }
    }

    fn next_id(&self) -> TaskId {
        TaskId(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

/// Thread-safe way to talk to a [`Reactor`]: register and cancel tasks,
/// wake them up, or shut the reactor down. Every request wakes the poll.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: Sender<Command>,
    waker: Arc<Waker>,
    ids: Arc<TokenGenerator>,
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl ReactorHandle {
    pub fn spawn(&self, task: Box<dyn Task>) -> io::Result<TaskId> {
        let id = self.next_id();
        self.send(Command::Spawn(id, task))?;
        Ok(id)
    }

    pub fn cancel(&self, id: TaskId) -> io::Result<()> {
        self.send(Command::Cancel(id))
    }

    pub fn wake(&self, id: TaskId) -> io::Result<()> {
        self.send(Command::Wake(id))
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.send(Command::Shutdown)
    }

    pub(crate) fn next_id(&self) -> TaskId {
        self.ids.next_id()
    }

    fn send(&self, cmd: Command) -> io::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor is gone"))?;
        self.waker.wake()
    }
}

struct Entry {
    task: Box<dyn Task>,
    deadline: Option<Instant>,
}

#[derive(Debug)]
enum StopReason {
    Finished,
    Failed(TaskError),
    StartFailed(TaskError),
    Hangup,
    ResourceError,
    Cancelled,
    Shutdown,
}

/// Single-threaded event loop driving a set of [`Task`]s.
///
/// Each cycle applies queued registrations and cancellations, polls OS
/// readiness, and dispatches notifications to the owning tasks. A task that
/// fails is stopped and removed without affecting the others.
pub struct Reactor {
    poll: Poll,
    events: Events,
    tasks: HashMap<TaskId, Entry>,
    pending: Pending,
    rx: Receiver<Command>,
    handle: ReactorHandle,
    config: ReactorConfig,
    shutdown: bool,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("tasks", &self.tasks.len())
            .field("config", &self.config)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = channel::unbounded();
        let handle = ReactorHandle {
            tx,
            waker: Arc::new(waker),
            ids: Arc::new(TokenGenerator::new()),
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            tasks: HashMap::new(),
            pending: Pending::default(),
            rx,
            handle,
            config,
            shutdown: false,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Registers `task`. It is started at the beginning of the next cycle.
    pub fn spawn(&mut self, task: Box<dyn Task>) -> TaskId {
        let id = self.handle.next_id();
        self.pending.spawned.push((id, task));
        id
    }

    /// Stops and removes task `id` at the beginning of the next cycle.
    pub fn cancel(&mut self, id: TaskId) {
        self.pending.cancelled.push(id);
    }

    /// Delivers an `execute` with [`Readiness::woken`] set during the next
    /// cycle. Wake-ups requested before the same cycle coalesce.
    pub fn wake(&mut self, id: TaskId) {
        self.pending.woken.push(id);
    }

    /// Makes [`Reactor::run`] return after the current cycle.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Number of started, not yet stopped tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Runs cycles until shutdown is requested, then stops every task.
    pub fn run(&mut self) -> io::Result<()> {
        let result = loop {
            if self.shutdown {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                log::error!("failed to poll tasks: {}", e);
                break Err(e);
            }
        };
        self.stop_all();

        result
    }

    /// Runs a single cycle: apply queued requests, poll once, dispatch.
    pub fn run_once(&mut self) -> io::Result<()> {
        self.drain_commands();
        self.start_spawned();
        self.apply_cancellations();
        if self.shutdown {
            return Ok(());
        }

        let timeout = self.next_timeout();
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let ready: Vec<(TaskId, Readiness)> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| (TaskId(event.token().0), Readiness::from_event(event)))
            .collect();
        let mut woken = std::mem::take(&mut self.pending.woken);
        woken.sort_unstable();
        woken.dedup();

        for (id, readiness) in ready {
            self.dispatch(id, readiness);
        }
        for id in woken {
            self.dispatch(id, Readiness::woken());
        }
        for id in self.expired_deadlines() {
            self.dispatch(id, Readiness::timer());
        }

        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Spawn(id, task) => self.pending.spawned.push((id, task)),
                Command::Cancel(id) => self.pending.cancelled.push(id),
                Command::Wake(id) => self.pending.woken.push(id),
                Command::Shutdown => self.shutdown = true,
            }
        }
    }

    fn start_spawned(&mut self) {
        let spawned = std::mem::take(&mut self.pending.spawned);
        for (id, task) in spawned {
            let mut entry = Entry {
                task,
                deadline: None,
            };
            let result = {
                let mut cx = Context::new(
                    id,
                    self.poll.registry(),
                    &mut self.pending,
                    &mut entry.deadline,
                    &self.handle,
                );
                entry.task.start(&mut cx)
            };
            log::debug!("{} ({}) registered", id, entry.task.name());
            self.tasks.insert(id, entry);
            if let Err(e) = result {
                self.terminate(id, StopReason::StartFailed(e));
            }
        }
    }

    fn apply_cancellations(&mut self) {
        let cancelled = std::mem::take(&mut self.pending.cancelled);
        for id in cancelled {
            self.terminate(id, StopReason::Cancelled);
        }
    }

    fn next_timeout(&self) -> Duration {
        if !self.pending.is_idle() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        self.tasks
            .values()
            .filter_map(|entry| entry.deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.config.poll_timeout, Duration::min)
    }

    fn expired_deadlines(&mut self) -> Vec<TaskId> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (id, entry) in self.tasks.iter_mut() {
            if entry.deadline.is_some_and(|deadline| deadline <= now) {
                entry.deadline = None;
                expired.push(*id);
            }
        }
        expired.sort_unstable();

        expired
    }

    fn dispatch(&mut self, id: TaskId, readiness: Readiness) {
        if readiness.error {
            self.terminate(id, StopReason::ResourceError);
            return;
        }
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };

        let result = {
            let mut cx = Context::new(
                id,
                self.poll.registry(),
                &mut self.pending,
                &mut entry.deadline,
                &self.handle,
            );
            entry.task.execute(&mut cx, readiness)
        };

        match result {
            Ok(Status::Running) if readiness.is_hangup() => {
                self.terminate(id, StopReason::Hangup);
            }
            Ok(Status::Running) => {}
            Ok(Status::Finished) => self.terminate(id, StopReason::Finished),
            Err(e) => self.terminate(id, StopReason::Failed(e)),
        }
    }

    fn terminate(&mut self, id: TaskId, reason: StopReason) {
        let Some(mut entry) = self.tasks.remove(&id) else {
            return;
        };
        match &reason {
            StopReason::Failed(e) | StopReason::StartFailed(e) => {
                log::warn!("{} ({}) failed: {}", id, entry.task.name(), e);
            }
            StopReason::ResourceError => {
                log::warn!("{} ({}) resource error", id, entry.task.name());
            }
            _ => log::debug!("{} ({}) stopping: {:?}", id, entry.task.name(), reason),
        }

        let mut cx = Context::new(
            id,
            self.poll.registry(),
            &mut self.pending,
            &mut entry.deadline,
            &self.handle,
        );
        entry.task.stop(&mut cx);
    }

    fn stop_all(&mut self) {
        let mut ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.terminate(id, StopReason::Shutdown);
        }
        // Never started, so there is nothing to stop.
        self.pending.spawned.clear();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
