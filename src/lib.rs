//! rsecure - engine-driven secure channels over non-blocking transports.
//!
//! A `SecureEngine` is a TLS- or DTLS-style record layer: it handshakes, wraps
//! application bytes into records and unwraps records back. The adapters in
//! [`adapter`] pump such an engine over a session: they drive the handshake,
//! size the buffers from the engine's hints, run delegated tasks off the I/O
//! task, retransmit datagram handshake flights and negotiate closing.
//!
//! [`transport`] hosts an adapter on a Tokio task over a byte stream or a
//! connected UDP socket. Any other event loop can host one by implementing
//! [`SessionContext`].

pub mod adapter;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod session;
pub mod transport;

pub use adapter::{ClosingState, DatagramEngineAdapter, HandshakeMarker, StreamEngineAdapter};
pub use buffer::{BufferAllocator, HeapAllocator, PooledAllocator};
pub use config::{EngineAdapterConfig, IncompleteDatagramPolicy};
pub use engine::{EngineResult, EngineStatus, HandshakeStatus, NullEngine, SecureEngine};
pub use error::{CloseType, SecureError};
pub use runtime::{AdapterEvent, BlockingExecutor, ManualTimer, TaskExecutor, Timer, TokioTimer};
pub use session::{CloseStrength, Incident, IncidentKind, IncidentPolicy, SessionContext, WriteFuture, WritePromise};
pub use transport::{DatagramSession, SessionConfig, SessionEvent, SessionEvents, SessionHandle, StreamSession};

// --- Top-Level Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

pub fn version_major() -> i32 {
  VERSION_MAJOR
}

pub fn version_minor() -> i32 {
  VERSION_MINOR
}

pub fn version_patch() -> i32 {
  VERSION_PATCH
}
