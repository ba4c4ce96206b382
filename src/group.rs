use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering},
    thread::{self, JoinHandle},
};

use crate::{
    reactor::{Reactor, ReactorConfig, ReactorHandle},
    task::{Task, TaskId},
};

/// Independent reactors, one per thread, sharing nothing.
///
/// New tasks are handed out round-robin, so each connection lives on exactly
/// one reactor for its whole life.
#[derive(Debug)]
pub struct ReactorGroup {
    handles: Vec<ReactorHandle>,
    joins: Vec<JoinHandle<io::Result<()>>>,
    next: AtomicUsize,
}

impl ReactorGroup {
    pub fn start(workers: usize, config: ReactorConfig) -> io::Result<Self> {
        if workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reactor group needs at least one worker",
            ));
        }

        let mut group = Self {
            handles: Vec::with_capacity(workers),
            joins: Vec::with_capacity(workers),
            next: AtomicUsize::new(0),
        };
        for i in 0..workers {
            let mut reactor = Reactor::with_config(config.clone())?;
            group.handles.push(reactor.handle());
            let join = thread::Builder::new()
                .name(format!("reactor-{}", i))
                .spawn(move || {
                    log::info!("reactor thread {:?} starting...", thread::current().id());
                    let result = reactor.run();
                    log::info!("reactor thread {:?} exiting...", thread::current().id());
                    result
                })?;
            group.joins.push(join);
        }

        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handle(&self, shard: usize) -> Option<&ReactorHandle> {
        self.handles.get(shard)
    }

    /// Registers `task` on the next reactor in turn. Returns the shard index
    /// together with the task's id on that shard.
    pub fn spawn(&self, task: Box<dyn Task>) -> io::Result<(usize, TaskId)> {
        let shard = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        let id = self.handles[shard].spawn(task)?;
        Ok((shard, id))
    }

    /// Asks every reactor to stop its tasks and exit.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            if let Err(e) = handle.shutdown() {
                log::warn!("failed to signal reactor shutdown: {}", e);
            }
        }
    }

    /// Waits for every reactor thread, returning the first failure.
    pub fn join(&mut self) -> io::Result<()> {
        let mut result = Ok(());
        while let Some(join) = self.joins.pop() {
            let outcome = match join.join() {
                Ok(r) => r,
                Err(_) => Err(io::Error::other("reactor thread panicked")),
            };
            if let Err(e) = outcome {
                log::error!("reactor thread failed: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }
}

impl Drop for ReactorGroup {
    fn drop(&mut self) {
        if self.joins.is_empty() {
            return;
        }
        self.shutdown();
        let _ = self.join();
    }
}
