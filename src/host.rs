//! The trait surface the engine calls outward on. `event.subscribe` isn't
//! modeled here — it's a long-lived stream the caller drives into
//! [`crate::router::dispatch`], not a request/response call.

use async_trait::async_trait;

use crate::error::DcpError;
use crate::model::Message;

/// What the host knows about a session, independent of its messages.
#[derive(Debug, Clone)]
pub struct HostSessionInfo {
    pub session_id: String,
    /// A sub-agent session has a non-null `parentID` on the host side.
    pub is_sub_agent: bool,
}

/// Reply to a pending permission request.
#[derive(Debug, Clone)]
pub enum PermissionReply {
    Allow,
    Deny,
    AllowWithMessage(String),
}

#[async_trait]
pub trait HostApi: Send + Sync {
    /// Used to detect sub-agent sessions.
    async fn session_get(&self, id: &str) -> Result<HostSessionInfo, DcpError>;

    /// Paginated in the host; this crate treats it as the full list
    /// currently visible to the model.
    async fn session_messages(&self, id: &str) -> Result<Vec<Message>, DcpError>;

    async fn session_abort(&self, id: &str) -> Result<(), DcpError>;

    async fn permission_reply(
        &self,
        request_id: &str,
        reply: PermissionReply,
    ) -> Result<(), DcpError>;
}

/// A host that answers every query with the least surprising default.
/// Sub-agent detection failure is treated as "not a sub-agent" by the
/// session store — this stub models exactly that fallback, which makes it
/// useful both for tests and as a documented default.
#[cfg(any(test, feature = "test-util"))]
pub struct NoopHost;

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl HostApi for NoopHost {
    async fn session_get(&self, id: &str) -> Result<HostSessionInfo, DcpError> {
        Ok(HostSessionInfo {
            session_id: id.to_string(),
            is_sub_agent: false,
        })
    }

    async fn session_messages(&self, _id: &str) -> Result<Vec<Message>, DcpError> {
        Ok(Vec::new())
    }

    async fn session_abort(&self, _id: &str) -> Result<(), DcpError> {
        Ok(())
    }

    async fn permission_reply(
        &self,
        _request_id: &str,
        _reply: PermissionReply,
    ) -> Result<(), DcpError> {
        Ok(())
    }
}
