//! Client-side per-call context (§3 "Server context / client context").

use crate::deadline::Deadline;
use crate::metadata::Metadata;

/// Mutable bag owned by one in-flight client call. `outgoing_metadata` is
/// freely mutable until the request starts (§3); `incoming_metadata` is
/// populated once response headers are validated.
#[derive(Debug, Clone, Default)]
pub struct ClientCallContext {
    pub outgoing_metadata: Metadata,
    pub incoming_metadata: Metadata,
    pub deadline: Option<Deadline>,
    pub previous_attempts: u32,
}

impl ClientCallContext {
    pub fn new(deadline: Option<Deadline>) -> Self {
        Self {
            outgoing_metadata: Metadata::new(),
            incoming_metadata: Metadata::new(),
            deadline,
            previous_attempts: 0,
        }
    }
}
