//! Call lifecycle states and the transitions between them.
//!
//! ```text
//!            OfferSent ----answer(yes)----+
//!           /    \                        v
//!   Idle --+      answer(no)--> Ended   Accepted --> Punching --> Active
//!           \    /                        ^                          |
//!            OfferReceived ---accept------+                          |
//!                  \--reject--> Ended               end --> Ended <--+
//!
//!   any non-terminal state --fail--> Failed
//! ```

use std::fmt;

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    // ---
    Idle,
    OfferSent,
    OfferReceived,
    Accepted,
    Punching,
    Active,
    Ended,
    Failed,
}

impl CallState {
    // ---
    /// `Ended` and `Failed` are final; a new call needs a new session.
    pub fn is_terminal(self) -> bool {
        // ---
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Applies `event`, or returns `None` if it is not allowed from here.
    pub fn next(self, event: CallEvent) -> Option<CallState> {
        // ---
        use CallEvent as E;
        use CallState as S;

        match (self, event) {
            (s, _) if s.is_terminal() => None,
            (_, E::End) => Some(S::Ended),
            (_, E::Fail) => Some(S::Failed),

            (S::Idle, E::SendOffer) => Some(S::OfferSent),
            (S::Idle, E::ReceiveOffer) => Some(S::OfferReceived),
            (S::OfferReceived, E::Accept) => Some(S::Accepted),
            (S::OfferReceived, E::Reject) => Some(S::Ended),
            (S::OfferSent, E::AnswerAccepted) => Some(S::Accepted),
            (S::OfferSent, E::AnswerRejected) => Some(S::Ended),
            (S::Accepted, E::StartPunching) => Some(S::Punching),
            (S::Punching, E::PathOpen) => Some(S::Active),
            _ => None,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::OfferSent => "OFFER_SENT",
            CallState::OfferReceived => "OFFER_RECEIVED",
            CallState::Accepted => "ACCEPTED",
            CallState::Punching => "PUNCHING",
            CallState::Active => "ACTIVE",
            CallState::Ended => "ENDED",
            CallState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Something that happened to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEvent {
    // ---
    /// We discovered our endpoints and produced an offer
    SendOffer,
    ReceiveOffer,
    /// Local user accepted an incoming offer
    Accept,
    /// Local user rejected an incoming offer
    Reject,
    AnswerAccepted,
    AnswerRejected,
    StartPunching,
    /// Both media paths are open
    PathOpen,
    End,
    Fail,
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            CallEvent::SendOffer => "send offer",
            CallEvent::ReceiveOffer => "receive offer",
            CallEvent::Accept => "accept",
            CallEvent::Reject => "reject",
            CallEvent::AnswerAccepted => "offer accepted",
            CallEvent::AnswerRejected => "offer rejected",
            CallEvent::StartPunching => "start punching",
            CallEvent::PathOpen => "path open",
            CallEvent::End => "end",
            CallEvent::Fail => "fail",
        };
        f.write_str(name)
    }
}
