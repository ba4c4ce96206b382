use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender};
use mio::{Interest, net::TcpStream};

use crate::{
    bitfield::Bitfield,
    message::{Frame, Handshake, MessageDecoder, ParseLimits, PeerMessage, ProtocolError},
    rating::Rating,
    reactor::ReactorHandle,
    task::{Context, Readiness, Status, Task, TaskError, TaskId},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_MAX_QUEUED_REQUESTS: usize = 500;

const READ_CHUNK: usize = 16 * 1024;
const MAX_READ_PER_EVENT: usize = 256 * 1024;
const MAX_WRITE_PER_EVENT: usize = 256 * 1024;
const MIN_TIMER: Duration = Duration::from_millis(100);

/// Per-torrent settings shared by every connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub limits: ParseLimits,
    /// Pieces we have, sent right after the handshake unless empty.
    pub local_bitfield: Bitfield,
    /// Deadline for the TCP connect and the handshake exchange.
    pub connect_timeout: Duration,
    /// A keep-alive goes out after this long without writing anything.
    pub keepalive_interval: Duration,
    /// The connection is dropped after this long without reading anything.
    pub idle_timeout: Duration,
    /// Blocks a peer may have waiting in our send queue.
    pub max_queued_requests: usize,
}

impl PeerConfig {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], piece_count: usize) -> Self {
        Self {
            info_hash,
            peer_id,
            limits: ParseLimits::new(piece_count),
            local_bitfield: Bitfield::new(piece_count),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_queued_requests: DEFAULT_MAX_QUEUED_REQUESTS,
        }
    }
}

/// Piece storage owned by the surrounding client.
pub trait BlockStore: Send + Sync {
    /// Persists a block received from a peer.
    fn store(&self, piece: u32, begin: u32, block: Bytes) -> io::Result<()>;

    /// Returns the requested block, or `None` if we do not have it.
    fn fetch(&self, piece: u32, begin: u32, length: u32) -> io::Result<Option<Bytes>>;
}

/// Instructions from the orchestrator to one connection.
#[derive(Debug)]
pub enum PeerCommand {
    Send(PeerMessage),
    Close,
}

/// What a connection reports to the orchestrator. Bitfields and ratings are
/// snapshots; the connection keeps its own copies.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        handle: PeerHandle,
        peer_id: [u8; 20],
    },
    Bitfield {
        id: TaskId,
        bitfield: Bitfield,
    },
    Have {
        id: TaskId,
        piece: u32,
    },
    /// The peer choked or unchoked us.
    Choke {
        id: TaskId,
        choked: bool,
    },
    /// The peer became interested or not interested in us.
    Interest {
        id: TaskId,
        interested: bool,
    },
    BlockReceived {
        id: TaskId,
        piece: u32,
        begin: u32,
        length: u32,
        rating: Rating,
    },
    BlockSent {
        id: TaskId,
        piece: u32,
        begin: u32,
        length: u32,
        rating: Rating,
    },
    Disconnected {
        id: TaskId,
        addr: SocketAddr,
        reason: String,
        bitfield: Bitfield,
        rating: Rating,
    },
}

/// Orchestrator side of an established connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: TaskId,
    addr: SocketAddr,
    commands: Sender<PeerCommand>,
    reactor: ReactorHandle,
}

impl PeerHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send(&self, msg: PeerMessage) -> io::Result<()> {
        self.command(PeerCommand::Send(msg))
    }

    pub fn close(&self) -> io::Result<()> {
        self.command(PeerCommand::Close)
    }

    fn command(&self, cmd: PeerCommand) -> io::Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "peer connection is gone"))?;
        self.reactor.wake(self.id)
    }
}

/// Everything a new connection needs besides its socket.
#[derive(Clone)]
pub struct PeerSetup {
    pub config: PeerConfig,
    pub events: Sender<PeerEvent>,
    pub store: Arc<dyn BlockStore>,
}

impl fmt::Debug for PeerSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSetup")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PeerSetup {
    pub fn new(config: PeerConfig, events: Sender<PeerEvent>, store: Arc<dyn BlockStore>) -> Self {
        Self {
            config,
            events,
            store,
        }
    }

    /// Turns accepted streams into connection tasks, for use with
    /// [`PeerListener`](crate::listener::PeerListener).
    pub fn acceptor(self) -> impl FnMut(TcpStream, SocketAddr) -> Box<dyn Task> + Send + 'static {
        move |stream: TcpStream, addr: SocketAddr| -> Box<dyn Task> {
            Box::new(PeerConnection::accepted(stream, addr, &self))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Outbound TCP connect still in progress.
    Connecting,
    /// Waiting for the peer's handshake.
    Handshake,
    Established,
}

#[derive(Debug)]
struct Outgoing {
    data: Bytes,
    /// `(piece, begin, length)` when this frame carries a block.
    block: Option<(u32, u32, u32)>,
}

/// Task owning one peer connection.
///
/// Both sides open with a handshake; once the peer's handshake matches our
/// info hash the connection is reported to the orchestrator together with a
/// [`PeerHandle`] for sending messages back. The peer's bitfield and our
/// rating of it live here and are only mutated by this task.
pub struct PeerConnection {
    addr: SocketAddr,
    stream: TcpStream,
    name: String,
    config: PeerConfig,
    store: Arc<dyn BlockStore>,
    events: Sender<PeerEvent>,
    commands_tx: Sender<PeerCommand>,
    commands_rx: Receiver<PeerCommand>,
    decoder: MessageDecoder,
    incoming: BytesMut,
    outgoing: VecDeque<Outgoing>,
    front_started: bool,
    phase: Phase,
    interest: Interest,
    bitfield: Bitfield,
    rating: Rating,
    peer_id: Option<[u8; 20]>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    bitfield_allowed: bool,
    last_read: Instant,
    last_write: Instant,
    close_reason: Option<String>,
}

impl PeerConnection {
    /// Starts a non-blocking connect to `addr`.
    pub fn connect(addr: SocketAddr, setup: &PeerSetup) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self::with_stream(stream, addr, setup, Phase::Connecting))
    }

    /// Wraps a stream accepted from a listener.
    pub fn accepted(stream: TcpStream, addr: SocketAddr, setup: &PeerSetup) -> Self {
        Self::with_stream(stream, addr, setup, Phase::Handshake)
    }

    fn with_stream(stream: TcpStream, addr: SocketAddr, setup: &PeerSetup, phase: Phase) -> Self {
        let (commands_tx, commands_rx) = channel::unbounded();
        let now = Instant::now();
        Self {
            addr,
            stream,
            name: format!("peer {}", addr),
            config: setup.config.clone(),
            store: setup.store.clone(),
            events: setup.events.clone(),
            commands_tx,
            commands_rx,
            decoder: MessageDecoder::new(setup.config.limits),
            incoming: BytesMut::with_capacity(READ_CHUNK),
            outgoing: VecDeque::new(),
            front_started: false,
            phase,
            interest: Interest::READABLE | Interest::WRITABLE,
            bitfield: Bitfield::new(setup.config.limits.piece_count),
            rating: Rating::default(),
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield_allowed: false,
            last_read: now,
            last_write: now,
            close_reason: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.peer_id
    }

    /// Pieces the peer announced so far.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn rating(&self) -> Rating {
        self.rating
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    fn process(&mut self, cx: &mut Context<'_>, readiness: Readiness) -> Result<Status, TaskError> {
        if readiness.timer {
            self.on_timer(cx)?;
        }
        if self.phase == Phase::Connecting && !self.check_connected()? {
            return Ok(Status::Running);
        }
        if self.drain_commands() {
            self.close_reason = Some("closed locally".to_string());
            return Ok(Status::Finished);
        }

        let eof = self.socket_read(cx)?;
        self.process_incoming(cx)?;
        if eof {
            return Err(TaskError::ConnectionClosed);
        }
        self.socket_write(cx)?;
        self.update_interest(cx)?;

        Ok(Status::Running)
    }

    fn check_connected(&mut self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                log::debug!("{} connected", self.name);
                self.phase = Phase::Handshake;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn on_timer(&mut self, cx: &mut Context<'_>) -> Result<(), TaskError> {
        if self.phase != Phase::Established {
            log::warn!("{} handshake timed out", self.name);
            return Err(TaskError::TimedOut);
        }
        if self.last_read.elapsed() >= self.config.idle_timeout {
            log::warn!("{} idle for too long", self.name);
            return Err(TaskError::TimedOut);
        }
        if self.outgoing.is_empty() && self.last_write.elapsed() >= self.config.keepalive_interval {
            self.enqueue(PeerMessage::keep_alive(), None);
        }
        self.arm_timer(cx);

        Ok(())
    }

    fn arm_timer(&self, cx: &mut Context<'_>) {
        let idle_left = self
            .config
            .idle_timeout
            .saturating_sub(self.last_read.elapsed());
        let keepalive_left = self
            .config
            .keepalive_interval
            .saturating_sub(self.last_write.elapsed());
        cx.set_timeout(idle_left.min(keepalive_left).max(MIN_TIMER));
    }

    /// Applies queued orchestrator commands. Returns `true` on `Close`.
    fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.commands_rx.try_recv() {
            match cmd {
                PeerCommand::Send(msg) => self.send_message(msg),
                PeerCommand::Close => return true,
            }
        }
        false
    }

    fn send_message(&mut self, msg: PeerMessage) {
        let block = match &msg {
            PeerMessage::Handshake(_) => {
                log::warn!("{} handshake was already sent", self.name);
                return;
            }
            PeerMessage::Choke => {
                self.am_choking = true;
                self.discard_queued_blocks(|_| true);
                None
            }
            PeerMessage::Unchoke => {
                self.am_choking = false;
                None
            }
            PeerMessage::Interested => {
                self.am_interested = true;
                None
            }
            PeerMessage::NotInterested => {
                self.am_interested = false;
                None
            }
            PeerMessage::Piece((index, begin, block)) => Some((*index, *begin, block.len() as u32)),
            _ => None,
        };
        log::trace!("{} <- {}", self.name, msg);
        self.enqueue(msg.encode(), block);
    }

    /// Queues the requested block unless we are choking the peer. A peer
    /// that keeps more than `max_queued_requests` blocks waiting is dropped.
    fn serve_request(&mut self, piece: u32, begin: u32, length: u32) -> Result<(), TaskError> {
        if self.am_choking {
            log::debug!("{} ignoring request while choked", self.name);
            return Ok(());
        }
        let max = self.config.max_queued_requests;
        if self.queued_blocks() >= max {
            return Err(ProtocolError::TooManyRequests { max }.into());
        }

        match self.store.fetch(piece, begin, length)? {
            Some(block) if block.len() == length as usize => {
                self.send_message(PeerMessage::Piece((piece, begin, block)));
            }
            Some(block) => log::warn!(
                "{} store returned {} bytes for block {}:{} of length {}",
                self.name,
                block.len(),
                piece,
                begin,
                length
            ),
            None => log::debug!("{} block {}:{} not available", self.name, piece, begin),
        }

        Ok(())
    }

    fn queued_blocks(&self) -> usize {
        self.outgoing.iter().filter(|out| out.block.is_some()).count()
    }

    fn enqueue(&mut self, data: Bytes, block: Option<(u32, u32, u32)>) {
        self.outgoing.push_back(Outgoing { data, block });
    }

    /// Drops queued block frames matching `pred`, except one already being
    /// written.
    fn discard_queued_blocks(&mut self, pred: impl Fn(&(u32, u32, u32)) -> bool) {
        let mut position = 0;
        let front_started = self.front_started;
        self.outgoing.retain(|out| {
            let in_flight = position == 0 && front_started;
            position += 1;
            in_flight || !out.block.as_ref().is_some_and(&pred)
        });
    }

    fn socket_read(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
        let mut total_read = 0;
        let mut buf = [0u8; READ_CHUNK];
        while total_read < MAX_READ_PER_EVENT {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.incoming.extend_from_slice(&buf[..n]);
                    self.last_read = Instant::now();
                    total_read += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        // Edge-triggered readiness will not fire again for data already waiting.
        cx.wake(cx.id());

        Ok(false)
    }

    fn socket_write(&mut self, cx: &mut Context<'_>) -> Result<(), TaskError> {
        let mut total_written = 0;
        while total_written < MAX_WRITE_PER_EVENT {
            let Some(front) = self.outgoing.front_mut() else {
                return Ok(());
            };
            match self.stream.write(&front.data) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection closed",
                    )
                    .into());
                }
                Ok(n) => {
                    front.data.advance(n);
                    self.front_started = true;
                    self.last_write = Instant::now();
                    total_written += n;
                    if front.data.is_empty() {
                        let done = self.outgoing.pop_front();
                        self.front_started = false;
                        if let Some(Outgoing {
                            block: Some((piece, begin, length)),
                            ..
                        }) = done
                        {
                            self.on_block_sent(cx, piece, begin, length);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if !self.outgoing.is_empty() {
            cx.wake(cx.id());
        }

        Ok(())
    }

    fn update_interest(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let interest = if self.phase == Phase::Connecting || !self.outgoing.is_empty() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest != self.interest {
            cx.reregister(&mut self.stream, interest)?;
            self.interest = interest;
        }

        Ok(())
    }

    fn process_incoming(&mut self, cx: &mut Context<'_>) -> Result<(), TaskError> {
        if self.phase == Phase::Handshake {
            let Some(handshake) = self.decoder.decode_handshake(&mut self.incoming)? else {
                return Ok(());
            };
            self.on_handshake(cx, handshake)?;
        }
        while let Some(frame) = self.decoder.decode(&mut self.incoming)? {
            match frame {
                Frame::KeepAlive => log::trace!("{} -> keep-alive", self.name),
                Frame::Message(msg) => self.on_message(cx, msg)?,
            }
        }

        Ok(())
    }

    fn on_handshake(&mut self, cx: &mut Context<'_>, handshake: Handshake) -> Result<(), TaskError> {
        if handshake.info_hash != self.config.info_hash {
            return Err(TaskError::InfoHashMismatch);
        }
        log::debug!("{} handshake complete", self.name);
        self.phase = Phase::Established;
        self.peer_id = Some(handshake.peer_id);
        self.bitfield_allowed = true;
        if self.config.local_bitfield.count_ones() > 0 {
            let msg = PeerMessage::Bitfield(self.config.local_bitfield.clone());
            self.enqueue(msg.encode(), None);
        }
        self.arm_timer(cx);

        let handle = PeerHandle {
            id: cx.id(),
            addr: self.addr,
            commands: self.commands_tx.clone(),
            reactor: cx.handle(),
        };
        let _ = self.events.send(PeerEvent::Connected {
            handle,
            peer_id: handshake.peer_id,
        });

        Ok(())
    }

    fn on_message(&mut self, cx: &mut Context<'_>, msg: PeerMessage) -> Result<(), TaskError> {
        log::trace!("{} -> {}", self.name, msg);
        let id = cx.id();
        let bitfield_allowed = std::mem::replace(&mut self.bitfield_allowed, false);
        match msg {
            PeerMessage::Handshake(_) => {
                return Err(ProtocolError::InvalidHandshake("duplicate handshake").into());
            }
            PeerMessage::Choke => {
                self.peer_choking = true;
                let _ = self.events.send(PeerEvent::Choke { id, choked: true });
            }
            PeerMessage::Unchoke => {
                self.peer_choking = false;
                let _ = self.events.send(PeerEvent::Choke { id, choked: false });
            }
            PeerMessage::Interested => {
                self.peer_interested = true;
                let _ = self.events.send(PeerEvent::Interest {
                    id,
                    interested: true,
                });
            }
            PeerMessage::NotInterested => {
                self.peer_interested = false;
                let _ = self.events.send(PeerEvent::Interest {
                    id,
                    interested: false,
                });
            }
            PeerMessage::Have(piece) => {
                self.bitfield.set(piece as usize);
                let _ = self.events.send(PeerEvent::Have { id, piece });
            }
            PeerMessage::Bitfield(bitfield) => {
                if !bitfield_allowed {
                    return Err(ProtocolError::UnexpectedBitfield.into());
                }
                self.bitfield = bitfield.clone();
                let _ = self.events.send(PeerEvent::Bitfield { id, bitfield });
            }
            PeerMessage::Request((piece, begin, length)) => {
                self.serve_request(piece, begin, length)?;
            }
            PeerMessage::Piece((piece, begin, block)) => {
                let length = block.len() as u32;
                self.rating.record_received(length as u64);
                self.store.store(piece, begin, block)?;
                let _ = self.events.send(PeerEvent::BlockReceived {
                    id,
                    piece,
                    begin,
                    length,
                    rating: self.rating,
                });
            }
            PeerMessage::Cancel((piece, begin, length)) => {
                self.discard_queued_blocks(|block| *block == (piece, begin, length));
            }
        }

        Ok(())
    }

    fn on_block_sent(&mut self, cx: &mut Context<'_>, piece: u32, begin: u32, length: u32) {
        self.rating.record_sent(length as u64);
        let _ = self.events.send(PeerEvent::BlockSent {
            id: cx.id(),
            piece,
            begin,
            length,
            rating: self.rating,
        });
    }
}

impl Task for PeerConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, cx: &mut Context<'_>) -> Result<(), TaskError> {
        cx.register(&mut self.stream, self.interest)?;
        let handshake = Handshake::new(self.config.info_hash, self.config.peer_id);
        self.enqueue(handshake.encode(), None);
        cx.set_timeout(self.config.connect_timeout);

        Ok(())
    }

    fn execute(&mut self, cx: &mut Context<'_>, readiness: Readiness) -> Result<Status, TaskError> {
        self.process(cx, readiness).inspect_err(|e| {
            self.close_reason = Some(e.to_string());
        })
    }

    fn stop(&mut self, cx: &mut Context<'_>) {
        if let Err(e) = cx.deregister(&mut self.stream) {
            log::debug!("{} failed to deregister: {}", self.name, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);

        let reason = self
            .close_reason
            .take()
            .unwrap_or_else(|| "stopped".to_string());
        log::info!("{} disconnected: {}", self.name, reason);
        let _ = self.events.send(PeerEvent::Disconnected {
            id: cx.id(),
            addr: self.addr,
            reason,
            bitfield: self.bitfield.clone(),
            rating: self.rating,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoStore;

    impl BlockStore for NoStore {
        fn store(&self, _piece: u32, _begin: u32, _block: Bytes) -> io::Result<()> {
            Ok(())
        }

        fn fetch(&self, _piece: u32, _begin: u32, _length: u32) -> io::Result<Option<Bytes>> {
            Ok(None)
        }
    }

    /// Answers every fetch with the same block.
    struct FixedStore(Bytes);

    impl BlockStore for FixedStore {
        fn store(&self, _piece: u32, _begin: u32, _block: Bytes) -> io::Result<()> {
            Ok(())
        }

        fn fetch(&self, _piece: u32, _begin: u32, _length: u32) -> io::Result<Option<Bytes>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn connection_with(
        store: Arc<dyn BlockStore>,
        max_queued_requests: usize,
    ) -> (PeerConnection, std::net::TcpListener) {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, _rx) = channel::unbounded();
        let mut config = PeerConfig::new([0; 20], [1; 20], 4);
        config.max_queued_requests = max_queued_requests;
        let setup = PeerSetup::new(config, tx, store);
        let conn = PeerConnection::connect(server.local_addr().unwrap(), &setup).unwrap();
        (conn, server)
    }

    fn connection() -> (PeerConnection, std::net::TcpListener) {
        connection_with(Arc::new(NoStore), DEFAULT_MAX_QUEUED_REQUESTS)
    }

    fn queued_tags(conn: &PeerConnection) -> Vec<Option<(u32, u32, u32)>> {
        conn.outgoing.iter().map(|out| out.block).collect()
    }

    #[test]
    fn cancel_keeps_block_being_written() {
        let (mut conn, _server) = connection();
        conn.enqueue(Bytes::from_static(b"a"), Some((0, 0, 1)));
        conn.enqueue(Bytes::from_static(b"b"), Some((0, 1, 1)));
        conn.enqueue(Bytes::from_static(b"c"), None);
        conn.front_started = true;

        conn.discard_queued_blocks(|block| *block == (0, 0, 1));
        assert_eq!(conn.outgoing.len(), 3);

        conn.discard_queued_blocks(|block| *block == (0, 1, 1));
        assert_eq!(queued_tags(&conn), vec![Some((0, 0, 1)), None]);
    }

    #[test]
    fn choke_drops_queued_blocks() {
        let (mut conn, _server) = connection();
        conn.send_message(PeerMessage::Unchoke);
        assert!(!conn.am_choking());
        conn.send_message(PeerMessage::Piece((1, 0, Bytes::from_static(b"xy"))));
        conn.send_message(PeerMessage::Piece((2, 0, Bytes::from_static(b"z"))));
        assert_eq!(queued_tags(&conn), vec![None, Some((1, 0, 2)), Some((2, 0, 1))]);

        conn.send_message(PeerMessage::Choke);
        assert!(conn.am_choking());
        assert_eq!(queued_tags(&conn), vec![None, None]);
    }

    #[test]
    fn interest_follows_sent_messages() {
        let (mut conn, _server) = connection();
        assert!(!conn.am_interested());
        conn.send_message(PeerMessage::Interested);
        assert!(conn.am_interested());
        conn.send_message(PeerMessage::NotInterested);
        assert!(!conn.am_interested());
    }

    #[test]
    fn handshake_is_not_queued_twice() {
        let (mut conn, _server) = connection();
        conn.send_message(PeerMessage::Handshake(Handshake::new([0; 20], [1; 20])));
        assert!(conn.outgoing.is_empty());
    }

    #[test]
    fn request_queue_is_bounded() {
        let store = Arc::new(FixedStore(Bytes::from_static(b"abcd")));
        let (mut conn, _server) = connection_with(store, 2);
        conn.send_message(PeerMessage::Unchoke);

        conn.serve_request(0, 0, 4).unwrap();
        conn.serve_request(0, 4, 4).unwrap();
        let err = conn.serve_request(0, 8, 4).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Protocol(ProtocolError::TooManyRequests { max: 2 })
        ));
        assert_eq!(conn.queued_blocks(), 2);
    }

    #[test]
    fn request_while_choking_is_not_queued() {
        let store = Arc::new(FixedStore(Bytes::from_static(b"abcd")));
        let (mut conn, _server) = connection_with(store, 1);

        for begin in 0..10 {
            conn.serve_request(0, begin * 4, 4).unwrap();
        }
        assert_eq!(conn.queued_blocks(), 0);
    }

    #[test]
    fn block_of_wrong_length_is_dropped() {
        let store = Arc::new(FixedStore(Bytes::from_static(b"abc")));
        let (mut conn, _server) = connection_with(store, 4);
        conn.send_message(PeerMessage::Unchoke);

        conn.serve_request(1, 0, 4).unwrap();
        assert_eq!(queued_tags(&conn), vec![None]);

        conn.serve_request(1, 0, 3).unwrap();
        assert_eq!(queued_tags(&conn), vec![None, Some((1, 0, 3))]);
    }
}
