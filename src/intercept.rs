//! Ordered response-interception rules.
//!
//! Each rule is a (predicate, transform) pair over a fully buffered
//! upstream response body. The rule set is fixed at startup and evaluated
//! in declared priority order; the first matching rule is applied
//! exclusively, so at most one transform ever runs per response. Rules
//! are tagged variants rather than trait objects, so dispatch is a
//! single `match` and the ordering is visible in one place.
//!
//! The canonical set:
//!
//! 1. [`RuleKind::BindCreatedConversation`]: on a successful
//!    conversation-creation response, record the caller as the owner of
//!    the new conversation id. Body passes through unchanged.
//! 2. [`RuleKind::RedactForeignListings`]: on a conversation listing,
//!    blank out the display name of every conversation the caller does
//!    not own, leaving order and all other fields intact.
//! 3. [`RuleKind::SanitizeHtml`]: on any HTML response, scrub the
//!    configured sensitive string and inject the redaction-styling
//!    script reference into `<head>`.

use http::{HeaderMap, Method, StatusCode, header};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ConfigHandle;
use crate::error::{GateError, GateResult};
use crate::store::ConversationStore;

/// Fixed marker replacing the display name of conversations the caller
/// does not own.
pub const REDACTED_NAME: &str = "🔒🔒🔒 Redacted";

/// Fixed placeholder replacing the configured sensitive string in HTML.
pub const EMAIL_PLACEHOLDER: &str = "Pro User";

/// Script reference injected before the closing head tag. The file itself
/// is served from the local static directory.
pub const INJECT_SNIPPET: &str = r#"<script src="/inject.js"></script>"#;

static LISTING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/api/organizations/[^/]+/chat_conversations").expect("listing pattern is valid")
});

/// Metadata about the inbound request, captured before upstream dispatch
/// so predicates and transforms can consult it once the response arrives.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Inbound HTTP method.
    pub method: Method,
    /// Path-and-query as dispatched upstream (placeholder already
    /// substituted).
    pub path: String,
    /// Verified caller identity.
    pub user_key: String,
}

/// The interception rules, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Bind a newly created conversation to the caller.
    BindCreatedConversation,
    /// Redact names of conversations the caller does not own.
    RedactForeignListings,
    /// Scrub and instrument HTML pages.
    SanitizeHtml,
}

impl RuleKind {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BindCreatedConversation => "bind_created",
            Self::RedactForeignListings => "redact_listing",
            Self::SanitizeHtml => "sanitize_html",
        }
    }
}

/// The ordered rule set plus the collaborators transforms need.
pub struct InterceptorChain {
    store: ConversationStore,
    config: ConfigHandle,
    rules: Vec<RuleKind>,
}

impl InterceptorChain {
    /// Build the canonical chain.
    pub fn new(store: ConversationStore, config: ConfigHandle) -> Self {
        Self {
            store,
            config,
            rules: vec![
                RuleKind::BindCreatedConversation,
                RuleKind::RedactForeignListings,
                RuleKind::SanitizeHtml,
            ],
        }
    }

    /// Return the first rule whose predicate matches, if any.
    ///
    /// This is a guarded dispatch, not a fan-out: zero or one rule applies
    /// per response.
    pub fn select(
        &self,
        req: &RequestMeta,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Option<RuleKind> {
        self.rules
            .iter()
            .copied()
            .find(|rule| Self::matches(*rule, req, status, headers))
    }

    fn matches(rule: RuleKind, req: &RequestMeta, status: StatusCode, headers: &HeaderMap) -> bool {
        match rule {
            RuleKind::BindCreatedConversation => {
                let path = req.path.split('?').next().unwrap_or("");
                req.method == Method::POST
                    && path.ends_with("/chat_conversations")
                    && status == StatusCode::CREATED
            }
            RuleKind::RedactForeignListings => {
                req.method == Method::GET
                    && LISTING_RE.is_match(&req.path)
                    && !req.path.contains("/chat_conversations/")
                    && status.is_success()
            }
            RuleKind::SanitizeHtml => headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
                .unwrap_or(false),
        }
    }

    /// Apply a rule's transform to the buffered body text.
    ///
    /// Transforms may read and write the ownership store. A body that does
    /// not carry the structure a rule expects is an error; the original
    /// bytes are discarded rather than passed through half-inspected.
    pub async fn apply(
        &self,
        rule: RuleKind,
        req: &RequestMeta,
        body: String,
    ) -> GateResult<String> {
        debug!(rule = rule.as_str(), path = %req.path, "applying interceptor");
        match rule {
            RuleKind::BindCreatedConversation => self.bind_created(req, body).await,
            RuleKind::RedactForeignListings => self.redact_listing(req, body).await,
            RuleKind::SanitizeHtml => Ok(self.sanitize_html(body)),
        }
    }

    /// Rule 1: record ownership of a freshly created conversation.
    async fn bind_created(&self, req: &RequestMeta, body: String) -> GateResult<String> {
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| GateError::BodyParse(format!("creation response is not JSON: {e}")))?;
        let conversation_id = parsed
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::BodyParse("creation response has no uuid".to_string()))?;

        self.store.bind(conversation_id, &req.user_key).await?;
        info!(conversation_id, "new conversation bound to caller");

        // The client sees exactly what upstream sent.
        Ok(body)
    }

    /// Rule 2: redact names of conversations the caller does not own.
    async fn redact_listing(&self, req: &RequestMeta, body: String) -> GateResult<String> {
        let mut items: Vec<Value> = serde_json::from_str(&body)
            .map_err(|e| GateError::BodyParse(format!("listing response is not an array: {e}")))?;

        let ids: Vec<String> = items
            .iter()
            .filter_map(|item| item.get("uuid").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        // One store round trip, then O(1) membership per item.
        let owned = self.store.owned_subset(&req.user_key, ids).await?;

        for item in &mut items {
            let is_owned = item
                .get("uuid")
                .and_then(Value::as_str)
                .map(|id| owned.contains(id))
                .unwrap_or(false);
            if !is_owned {
                if let Some(obj) = item.as_object_mut() {
                    obj.insert(
                        "name".to_string(),
                        Value::String(REDACTED_NAME.to_string()),
                    );
                }
            }
        }

        serde_json::to_string(&items)
            .map_err(|e| GateError::BodyParse(format!("failed to re-serialize listing: {e}")))
    }

    /// Rule 3: scrub the configured sensitive string and inject the
    /// styling script before the first closing head tag.
    fn sanitize_html(&self, body: String) -> String {
        let config = self.config.current();
        let mut body = body;
        if !config.redact_email.is_empty() {
            body = body.replace(&config.redact_email, EMAIL_PLACEHOLDER);
        }
        body.replacen("</head>", &format!("{INJECT_SNIPPET}</head>"), 1)
    }
}
