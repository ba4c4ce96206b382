use std::{
    fmt, io,
    time::{Duration, Instant},
};

use mio::{Interest, Registry, Token, event::Source};

use crate::{
    message::ProtocolError,
    reactor::{Pending, ReactorHandle},
};

/// Identifies a task inside the reactor that runs it. Also used as the
/// `mio::Token` of every source the task registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// What `execute` tells the reactor about the task's future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Keep the task registered and deliver further notifications.
    Running,
    /// The task is done; the reactor stops and removes it.
    Finished,
}

/// Reasons a task terminates abnormally. Each one ends only the task that
/// returned it.
#[derive(Debug)]
pub enum TaskError {
    Io(io::Error),
    Protocol(ProtocolError),
    ConnectionClosed,
    TimedOut,
    InfoHashMismatch,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Io(e) => write!(f, "IO error: {}", e),
            TaskError::Protocol(e) => write!(f, "protocol violation: {}", e),
            TaskError::ConnectionClosed => write!(f, "connection closed"),
            TaskError::TimedOut => write!(f, "timed out"),
            TaskError::InfoHashMismatch => write!(f, "info_hash mismatch"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Io(e) => Some(e),
            TaskError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        TaskError::Io(err)
    }
}

impl From<ProtocolError> for TaskError {
    fn from(err: ProtocolError) -> Self {
        TaskError::Protocol(err)
    }
}

/// Why `execute` is being called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    /// Someone called `wake` for this task.
    pub woken: bool,
    /// The deadline set with [`Context::set_timeout`] expired.
    pub timer: bool,
}

impl Readiness {
    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            woken: false,
            timer: false,
        }
    }

    pub(crate) fn woken() -> Self {
        Self {
            woken: true,
            ..Self::default()
        }
    }

    pub(crate) fn timer() -> Self {
        Self {
            timer: true,
            ..Self::default()
        }
    }

    /// The remote end went away; the task gets this one last `execute`.
    pub fn is_hangup(&self) -> bool {
        self.read_closed || self.write_closed
    }
}

/// A unit of work scheduled by a [`Reactor`](crate::reactor::Reactor).
///
/// The lifecycle is `start` once, `execute` once per readiness notification,
/// then `stop` once. All three take a [`Context`], which only the reactor can
/// build, so no other code can drive a task through its phases.
///
/// None of the callbacks may block.
pub trait Task: Send {
    /// Used in log lines.
    fn name(&self) -> &str {
        "task"
    }

    /// One-time setup, typically registering sources. An error stops the
    /// task before any `execute`.
    fn start(&mut self, _cx: &mut Context<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Reacts to one readiness notification, doing only the work that is
    /// possible without blocking.
    fn execute(&mut self, cx: &mut Context<'_>, readiness: Readiness) -> Result<Status, TaskError>;

    /// Teardown. Called exactly once, also when `start` failed halfway.
    fn stop(&mut self, _cx: &mut Context<'_>) {}
}

/// The reactor's view handed to a task while one of its callbacks runs.
pub struct Context<'a> {
    id: TaskId,
    registry: &'a Registry,
    pending: &'a mut Pending,
    deadline: &'a mut Option<Instant>,
    handle: &'a ReactorHandle,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        id: TaskId,
        registry: &'a Registry,
        pending: &'a mut Pending,
        deadline: &'a mut Option<Instant>,
        handle: &'a ReactorHandle,
    ) -> Self {
        Self {
            id,
            registry,
            pending,
            deadline,
            handle,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Registers `source` so its readiness is delivered to this task.
    pub fn register<S>(&self, source: &mut S, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.register(source, self.id.token(), interest)
    }

    pub fn reregister<S>(&self, source: &mut S, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.reregister(source, self.id.token(), interest)
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.deregister(source)
    }

    /// Queues a new task on the same reactor. It is started at the beginning
    /// of the next cycle.
    pub fn spawn(&mut self, task: Box<dyn Task>) -> TaskId {
        let id = self.handle.next_id();
        self.pending.spawned.push((id, task));
        id
    }

    /// Requests that task `id` be stopped. Takes effect between dispatch
    /// cycles, never while that task's `execute` is running.
    pub fn cancel(&mut self, id: TaskId) {
        self.pending.cancelled.push(id);
    }

    /// Schedules an `execute` with [`Readiness::woken`] set for task `id`.
    pub fn wake(&mut self, id: TaskId) {
        self.pending.woken.push(id);
    }

    /// Arms this task's deadline. Replaces any previous one.
    pub fn set_timeout(&mut self, after: Duration) {
        *self.deadline = Some(Instant::now() + after);
    }

    pub fn clear_timeout(&mut self) {
        *self.deadline = None;
    }

    /// A handle to the reactor running this task, usable from any thread.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }
}
