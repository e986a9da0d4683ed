//! Authenticated caller identity handed to the pipeline by the web layer.

use serde::{Deserialize, Serialize};

/// An already-authenticated subject.
///
/// The gateway performs no authentication itself; whoever constructs an
/// `Identity` vouches for it. The pipeline only uses it to attribute work in
/// logs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable identifier of the subject (user id, service account, ...).
    pub subject_id: String,

    /// Coarse role attached by the authenticating layer.
    pub role: String,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            role: role.into(),
        }
    }
}
