//! Call session: the state machine that drives one peer-to-peer call.
//!
//! ```text
//!  start_call / accept      handle_signal         connect              end
//!  (STUN both sockets) --> (offer / answer) --> (punch both paths) --> (stop media,
//!                                               (spawn media tasks)     release sockets)
//! ```
//!
//! Signals travel through a channel owned by the application; the session
//! produces and consumes [`CallSignal`] values and never touches it.
//! [`LineSignaling`] carries them as JSON lines over any byte stream.

pub mod call;
pub mod error;
pub mod signal;
pub mod signaling;
pub mod state;

pub use call::CallSession;
pub use error::{CallError, SignalingError};
pub use signal::{CallSignal, MediaEndpoints};
pub use signaling::LineSignaling;
pub use state::{CallEvent, CallState};
