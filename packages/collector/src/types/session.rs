//! Persisted protocol session.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Schema tag of the session blob.
pub const SESSION_VERSION: i32 = 1;

/// The single persisted session record.
///
/// `data` is opaque to storage; only the connection layer decodes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub version: i32,
    pub data: Vec<u8>,
}

impl Session {
    /// Encode an authorized session into a storable record.
    pub fn from_data(data: &SessionData) -> Result<Self> {
        Ok(Self {
            version: SESSION_VERSION,
            data: serde_json::to_vec(data)?,
        })
    }

    /// Decode the stored blob.
    pub fn decode(&self) -> Result<SessionData> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Authorization material produced by a successful login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub dc_id: i32,
    pub addr: String,
    pub auth_key: Vec<u8>,
    pub auth_key_id: Vec<u8>,
    pub salt: i64,
}

// Key material stays out of logs.
impl std::fmt::Debug for SessionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionData")
            .field("dc_id", &self.dc_id)
            .field("addr", &self.addr)
            .field("auth_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}
