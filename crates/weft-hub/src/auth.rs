//! Token validation seam.
//!
//! The hub checks upgrade tokens against an external auth collaborator;
//! this module defines that contract and ships a static-token
//! implementation for development and tests. Rate limiting, login UI,
//! and session cookies belong to the collaborator, not here.

use std::collections::HashSet;

use async_trait::async_trait;

/// Which identity namespace a token is checked against.
///
/// Browser tokens and tool-pipe tokens are disjoint namespaces; a valid
/// browser token says nothing about the tool path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Browser clients upgrading on the browser path.
    Browser,
    /// Tool-server clients (bridges) upgrading on the tool path.
    ToolPipe,
}

/// The collaborator's verdict on a token.
#[derive(Debug, Clone)]
pub struct TokenDecision {
    /// Whether the token is accepted.
    pub valid: bool,
    /// Authenticated subject, when accepted.
    pub subject: Option<String>,
    /// Rejection reason, when refused.
    pub reason: Option<String>,
}

impl TokenDecision {
    /// An accepting decision.
    #[must_use]
    pub fn allow(subject: impl Into<String>) -> Self {
        Self {
            valid: true,
            subject: Some(subject.into()),
            reason: None,
        }
    }

    /// A refusing decision.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            subject: None,
            reason: Some(reason.into()),
        }
    }
}

/// External auth collaborator contract.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate `token` for `audience`.
    async fn validate(&self, token: &str, audience: Audience) -> TokenDecision;
}

/// Static token sets, one per audience.
///
/// An audience with no configured tokens is open, which is convenient
/// for development; production deployments configure both sets or plug
/// in a real collaborator.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    browser: HashSet<String>,
    tool_pipe: HashSet<String>,
}

impl StaticTokenValidator {
    /// A validator with no tokens (both audiences open).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` on the browser audience.
    #[must_use]
    pub fn with_browser_token(mut self, token: impl Into<String>) -> Self {
        self.browser.insert(token.into());
        self
    }

    /// Accept `token` on the tool-pipe audience.
    #[must_use]
    pub fn with_tool_token(mut self, token: impl Into<String>) -> Self {
        self.tool_pipe.insert(token.into());
        self
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str, audience: Audience) -> TokenDecision {
        let accepted = match audience {
            Audience::Browser => &self.browser,
            Audience::ToolPipe => &self.tool_pipe,
        };
        if accepted.is_empty() {
            return TokenDecision::allow("anonymous");
        }
        if accepted.contains(token) {
            TokenDecision::allow(token)
        } else {
            TokenDecision::deny("invalid token")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_audience_accepts_anything() {
        let v = StaticTokenValidator::new();
        assert!(v.validate("", Audience::Browser).await.valid);
        assert!(v.validate("whatever", Audience::ToolPipe).await.valid);
    }

    #[tokio::test]
    async fn configured_audience_requires_a_match() {
        let v = StaticTokenValidator::new().with_browser_token("s3cret");
        assert!(v.validate("s3cret", Audience::Browser).await.valid);
        assert!(!v.validate("wrong", Audience::Browser).await.valid);
        assert!(!v.validate("", Audience::Browser).await.valid);
    }

    #[tokio::test]
    async fn audiences_are_disjoint_namespaces() {
        let v = StaticTokenValidator::new()
            .with_browser_token("browser-tok")
            .with_tool_token("pipe-tok");
        assert!(!v.validate("browser-tok", Audience::ToolPipe).await.valid);
        assert!(!v.validate("pipe-tok", Audience::Browser).await.valid);
    }

    #[tokio::test]
    async fn denial_carries_a_reason() {
        let v = StaticTokenValidator::new().with_browser_token("t");
        let decision = v.validate("nope", Audience::Browser).await;
        assert_eq!(decision.reason.as_deref(), Some("invalid token"));
    }
}
