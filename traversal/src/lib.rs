//! NAT traversal for peer-to-peer calls.
//!
//! Three pieces cooperate to open a direct UDP path between two hosts that
//! sit behind unknown NATs:
//!
//! - [`StunClient`] learns the public (NAT-mapped) endpoint of a socket.
//! - The [`rendezvous`] protocol lets two participants swap their
//!   `localIp:localPort:publicIp:publicPort` tuples over TCP.
//! - [`HolePuncher`] bursts probes at the peer until the first datagram
//!   arrives on the same socket.
//!
//! None of them own the UDP socket; callers bind it once and reuse it for
//! discovery, punching and, afterwards, media.

pub mod error;
pub mod net;
pub mod punch;
pub mod rendezvous;
pub mod stun;

pub use error::{PunchError, RendezvousError, StunError};
pub use net::{local_endpoint, local_ipv4};
pub use punch::{HolePuncher, PunchOutcome, PROBE};
pub use rendezvous::{exchange, RendezvousServer};
pub use stun::{StunClient, StunTransaction, TransactionId, MAGIC_COOKIE};
