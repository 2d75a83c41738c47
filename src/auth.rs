use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

/// Roles allowed to change dispatch data.
pub const WRITE_ROLES: &[&str] = &["admin"];

/// Roles allowed to read dispatch data.
pub const READ_ROLES: &[&str] = &["admin", "user"];

/// What a verified bearer token says about its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub role: String,
    /// `None` never expires.
    pub expires_at: Option<OffsetDateTime>,
}

impl Claims {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn has_any_role(&self, allowed: &[&str]) -> bool {
        allowed.iter().any(|r| self.role.eq_ignore_ascii_case(r))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingToken,
    #[error("invalid Authorization header format, expected 'Bearer <token>'")]
    MalformedHeader,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    Expired,
    #[error("role '{0}' is not allowed to perform this action")]
    Forbidden(String),
}

impl AuthError {
    /// 403 rather than 401.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, AuthError::Forbidden(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedHeader => "malformed_header",
            AuthError::InvalidToken => "invalid_token",
            AuthError::Expired => "expired",
            AuthError::Forbidden(_) => "forbidden",
        }
    }
}

/// Turns a bearer token into claims. Signature checks and key caching
/// belong to the implementation.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Fixed token table, loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>, role: impl Into<String>) -> Self {
        self.tokens.insert(
            token.into(),
            Claims {
                subject: subject.into(),
                role: role.into(),
                expires_at: None,
            },
        );
        self
    }

    /// Parse `token:subject:role` entries separated by commas.
    pub fn parse(list: &str) -> Result<Self, String> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .try_fold(Self::new(), |verifier, entry| {
                let mut parts = entry.splitn(3, ':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(token), Some(subject), Some(role))
                        if !token.is_empty() && !subject.is_empty() && !role.is_empty() =>
                    {
                        Ok(verifier.with_token(token, subject, role))
                    }
                    _ => Err(format!("bad token entry '{entry}', expected token:subject:role")),
                }
            })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::MissingToken)?;
    let (scheme, token) = header.trim().split_once(' ').ok_or(AuthError::MalformedHeader)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

/// Verify the caller and check their role against `allowed`.
pub async fn authorize(
    verifier: &dyn TokenVerifier,
    header: Option<&str>,
    allowed: &[&str],
) -> Result<Claims, AuthError> {
    let token = bearer_token(header)?;
    let claims = verifier.verify(token).await?;
    if claims.is_expired(OffsetDateTime::now_utc()) {
        return Err(AuthError::Expired);
    }
    if !claims.has_any_role(allowed) {
        debug!(subject = %claims.subject, role = %claims.role, "role not allowed");
        return Err(AuthError::Forbidden(claims.role));
    }
    Ok(claims)
}
