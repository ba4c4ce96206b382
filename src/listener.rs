use std::{io, net::SocketAddr};

use mio::{
    Interest,
    net::{TcpListener, TcpStream},
};

use crate::task::{Context, Readiness, Status, Task, TaskError};

type Acceptor = Box<dyn FnMut(TcpStream, SocketAddr) -> Box<dyn Task> + Send>;

/// Accepts inbound connections and spawns one task per accepted stream on
/// the same reactor.
pub struct PeerListener {
    listener: TcpListener,
    acceptor: Acceptor,
    name: String,
}

impl PeerListener {
    /// `acceptor` builds the task that will own each accepted stream.
    pub fn new<F>(listener: TcpListener, acceptor: F) -> io::Result<Self>
    where
        F: FnMut(TcpStream, SocketAddr) -> Box<dyn Task> + Send + 'static,
    {
        let name = format!("listener {}", listener.local_addr()?);
        Ok(Self {
            listener,
            acceptor: Box::new(acceptor),
            name,
        })
    }

    pub fn bind<F>(addr: SocketAddr, acceptor: F) -> io::Result<Self>
    where
        F: FnMut(TcpStream, SocketAddr) -> Box<dyn Task> + Send + 'static,
    {
        Self::new(TcpListener::bind(addr)?, acceptor)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Task for PeerListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, cx: &mut Context<'_>) -> Result<(), TaskError> {
        cx.register(&mut self.listener, Interest::READABLE)?;
        log::info!("{} accepting connections", self.name);
        Ok(())
    }

    fn execute(&mut self, cx: &mut Context<'_>, readiness: Readiness) -> Result<Status, TaskError> {
        if !readiness.readable {
            return Ok(Status::Running);
        }
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = cx.spawn((self.acceptor)(stream, addr));
                    log::debug!("{} accepted {} as {}", self.name, addr, id);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Status::Running)
    }

    fn stop(&mut self, cx: &mut Context<'_>) {
        if let Err(e) = cx.deregister(&mut self.listener) {
            log::warn!("{} failed to deregister: {}", self.name, e);
        }
    }
}
