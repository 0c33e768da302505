//! Incident correlation ids.
//!
//! An incident id is minted at the first detection of an anomaly
//! (chaos trigger, watchdog timeout, invariant violation) and carried
//! by every related transition record, task dump and log line so the
//! whole event chain can be stitched together afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque correlation token, e.g. `stall-3fa9c2d1`.
///
/// Not persisted beyond process lifetime; the prefix names the
/// detection source for grep-ability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    /// Mint a fresh id with the given source prefix.
    pub fn new(prefix: &str) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        IncidentId(format!("{}-{}", prefix, &hex[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
