//! # parley-protocol
//!
//! Wire envelope definitions for the Parley chat relay.
//!
//! Every message exchanged with a client, and every message carried over the
//! presence store's pub/sub bus, is a JSON [`Envelope`]:
//!
//! ```json
//! {"Content":"hi","Channel":"lobby","From":"alice","Type":"text","TimeStamp":1700000000}
//! ```
//!
//! ## Envelope Types
//!
//! - `welcome` - Greeting sent directly to a peer that just joined
//! - `joined` - Published when a user joins a channel
//! - `text` - A chat line, carries `TimeStamp`
//! - `left` - Published when a user leaves a channel
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::text("lobby", "alice", "hi", 1_700_000_000);
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(encoded.as_bytes()).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, decode_lenient, encode, ProtocolError};
pub use envelope::{unix_timestamp, username_taken_notice, Envelope, MessageKind, RETRY_NOTICE};
