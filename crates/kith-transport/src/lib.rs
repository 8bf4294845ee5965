//! Capabilities the Kith client core consumes without implementing:
//! a relay that forwards opaque payloads by public key, and a direct peer
//! transport negotiated through opaque offers.
//!
//! Concrete implementations (WebRTC data channels, a hosted broker) live
//! outside this workspace. `testing` provides in-memory doubles for both.

pub mod traits;
pub mod testing;

pub use traits::*;
