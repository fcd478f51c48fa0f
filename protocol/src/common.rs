/*!
Types carried inside signaling payloads.
*/

use serde::{Deserialize, Serialize};

/// Proposed ICE candidate of one peer, passed to the other peer without modifications.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line itself.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate for the first media section.
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_owned()),
            sdp_m_line_index: Some(0),
        }
    }
}
