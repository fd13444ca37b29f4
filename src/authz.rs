//! Per-conversation authorization gate.
//!
//! Runs after authentication and before forwarding. Conversation-scoped
//! paths are checked against the ownership store with deny-by-default
//! semantics; a store failure is a hard 500, never an allow. The two
//! aggregate count endpoints are answered locally with a fixed `0` so
//! they cannot leak cross-owner totals while still satisfying clients
//! that poll them.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::{GateError, GateResult};
use crate::store::ConversationStore;

static CONVERSATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/chat_conversations/([a-z0-9-]+)").expect("pattern is valid"));

/// Outcome of the authorization check for an authenticated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzDecision {
    /// Forward the request upstream.
    Allowed,
    /// Answer locally with the fixed aggregate count.
    AggregateShortCircuit,
}

/// Decide whether an authenticated caller may proceed on `path`.
///
/// Paths that do not address a specific conversation are allowed; paths
/// that do must have an ownership row matching the caller.
pub async fn authorize(
    path: &str,
    user_key: &str,
    store: &ConversationStore,
) -> GateResult<AuthzDecision> {
    if path.ends_with("chat_conversations/count") || path.ends_with("chat_conversations/count_all")
    {
        return Ok(AuthzDecision::AggregateShortCircuit);
    }

    let Some(caps) = CONVERSATION_RE.captures(path) else {
        return Ok(AuthzDecision::Allowed);
    };
    let conversation_id = &caps[1];

    match store.owner_of(conversation_id).await? {
        None => {
            warn!(conversation_id, "no ownership binding for conversation");
            Err(GateError::AuthorizationDenied(format!(
                "no binding for conversation {conversation_id}"
            )))
        }
        Some(binding) if binding.user_key != user_key => {
            warn!(conversation_id, "caller does not own conversation");
            Err(GateError::AuthorizationDenied(format!(
                "owner mismatch for conversation {conversation_id}"
            )))
        }
        Some(_) => Ok(AuthzDecision::Allowed),
    }
}
