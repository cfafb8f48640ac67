//! Call signals exchanged through the chat-protocol channel.
//!
//! Each signal is one JSON object; endpoint pairs travel in their 4-tuple
//! text form:
//!
//! ```text
//! {"type":"offer","endpoints":{"video":"10.0.0.5:40000:203.0.113.9:61000","audio":"10.0.0.5:40001:203.0.113.9:61001"}}
//! {"type":"answer","accepted":true,"endpoints":{"video":"...","audio":"..."}}
//! {"type":"answer","accepted":false}
//! {"type":"end"}
//! ```

use peercall_common::EndpointPair;
use serde::{Deserialize, Serialize};

/// Video and audio endpoints of one side of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEndpoints {
    // ---
    pub video: EndpointPair,
    pub audio: EndpointPair,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallSignal {
    // ---
    /// Caller's endpoints, starting a call
    Offer {
        endpoints: MediaEndpoints,
    },

    /// Callee's decision; endpoints are present only when accepted
    Answer {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoints: Option<MediaEndpoints>,
    },

    /// Either side hangs up
    End,
}

impl CallSignal {
    // ---
    pub fn accept(endpoints: MediaEndpoints) -> Self {
        // ---
        CallSignal::Answer {
            accepted: true,
            endpoints: Some(endpoints),
        }
    }

    pub fn reject() -> Self {
        // ---
        CallSignal::Answer {
            accepted: false,
            endpoints: None,
        }
    }
}
