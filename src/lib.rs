pub mod bitfield;
pub mod group;
pub mod listener;
pub mod message;
pub mod peer;
pub mod rating;
pub mod reactor;
pub mod task;

pub use bitfield::{Bitfield, BitfieldError};
pub use group::ReactorGroup;
pub use listener::PeerListener;
pub use message::{Frame, Handshake, MessageDecoder, ParseLimits, Parsed, PeerMessage, ProtocolError};
pub use peer::{BlockStore, PeerConfig, PeerConnection, PeerEvent, PeerHandle, PeerSetup};
pub use rating::Rating;
pub use reactor::{Reactor, ReactorConfig, ReactorHandle};
pub use task::{Context, Readiness, Status, Task, TaskError, TaskId};

/// Block size clients usually request, in bytes.
pub const BLOCK_SIZE: usize = 16 * 1024;
