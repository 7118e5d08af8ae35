//! Server-side per-call context (§3 "Server context / client context").

use crate::auth::AuthContext;
use crate::credential::Credential;
use crate::deadline::Deadline;
use crate::metadata::Metadata;

/// Mutable bag owned by one in-flight server call.
///
/// `client_headers`/`client_metadata`/`client_deadline` are read-only from
/// the handler's point of view; `outgoing_metadata` freezes once the
/// response commits (§4.8's `RESPONSE_HEADERS_WRITTEN` transition).
pub struct ServerCallContext {
    pub client_metadata: Metadata,
    pub client_deadline: Option<Deadline>,
    pub outgoing_metadata: Metadata,
    pub outgoing_credential: Option<Credential>,
    pub auth_context: Option<AuthContext>,
    /// 0 on the first attempt; the value of `tempo-previous-rpc-attempts`
    /// otherwise (§4.4, §9).
    pub previous_attempts: u32,
}

impl ServerCallContext {
    pub fn new(client_metadata: Metadata, client_deadline: Option<Deadline>) -> Self {
        Self {
            client_metadata,
            client_deadline,
            outgoing_metadata: Metadata::new(),
            outgoing_credential: None,
            auth_context: None,
            previous_attempts: 0,
        }
    }

    /// Freeze outgoing metadata — called at the `RESPONSE_HEADERS_WRITTEN`
    /// transition (§4.8), never by handler code directly.
    pub fn freeze_outgoing(&mut self) {
        self.outgoing_metadata.freeze();
    }
}
