//! # tetherfi-events
//!
//! Event and status types shared between the tetherfi proxy core and the
//! layers that observe it.
//!
//! ## Design Principles
//!
//! - Events are immutable records of something a proxy session did
//! - Every event carries the [`SessionId`] of the session that produced it
//! - A `Clear` variant tells observers to drop what they have rendered so far
//! - The proxy's running status is a single finite state, never a history
//!
//! ## Event Types
//!
//! - [`ConnectionEvent`]: a TCP request was parsed or a UDP datagram was routed
//! - [`ErrorEvent`]: a session failed, with the request/destination if known
//! - [`RunningStatus`]: lifecycle state of the proxy as a whole
//! - [`TetherClient`]: a device seen by the proxy, with its transfer totals

mod error;
mod id;
mod status;
mod types;

pub use error::EventError;
pub use id::SessionId;
pub use status::RunningStatus;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
