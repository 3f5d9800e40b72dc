//! Response bodies of the REST API

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether this replica holds the leader lease
    pub leader: bool,
}
