//! Error types for the GitHub client.

use crate::graphql::GraphQLError;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Result type alias for GitHub operations.
pub type GitHubResult<T> = Result<T, GitHubError>;

/// Maximum number of error-body bytes decoded into an [`ApiError`].
pub const MAX_ERROR_BODY_BYTES: usize = 8 * 1024;

/// Error kinds for categorizing GitHub errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitHubErrorKind {
    // Configuration errors
    /// Invalid base URL.
    InvalidBaseUrl,
    /// Invalid GitHub App credentials.
    InvalidAppCredentials,
    /// Invalid configuration.
    InvalidConfiguration,

    // Authentication errors
    /// Bad credentials (401).
    BadCredentials,
    /// GitHub App authentication failed.
    AppAuthenticationFailed,

    // Request errors
    /// Request validation failed (400).
    ValidationError,
    /// Invalid parameter.
    InvalidParameter,
    /// Unprocessable entity (422).
    UnprocessableEntity,

    // Authorization and resource errors
    /// Access forbidden (403). May be a disguised rate limit.
    Forbidden,
    /// Resource not found (404).
    NotFound,
    /// Resource conflict (409).
    Conflict,
    /// Resource is gone (410).
    Gone,
    /// Unavailable for legal reasons (451).
    UnavailableForLegalReasons,

    // Rate limit errors
    /// Too many requests (429).
    TooManyRequests,
    /// The self-imposed limiter could not grant the request.
    InternalRateLimitExceeded,

    // Network errors
    /// Connection failed.
    ConnectionFailed,
    /// Request timeout reported by the HTTP stack.
    Timeout,
    /// DNS resolution failed.
    DnsResolutionFailed,
    /// TLS certificate or authority verification failed.
    TlsError,
    /// Redirect limit reached.
    TooManyRedirects,
    /// URL scheme not supported by the HTTP stack.
    UnsupportedScheme,

    // Context errors
    /// Caller cancelled the call.
    Cancelled,
    /// Caller deadline elapsed.
    DeadlineExceeded,

    // Concurrency throttle
    /// Distributed lock backend unreachable or lock not obtained.
    LockUnavailable,

    // Server errors
    /// Internal server error (500).
    InternalError,
    /// Bad gateway (502).
    BadGateway,
    /// Service unavailable (503).
    ServiceUnavailable,

    // Response errors
    /// Failed to deserialize response.
    DeserializationError,

    // GraphQL errors
    /// The GraphQL response carried errors.
    QueryError,
    /// The GraphQL document could not be parsed.
    QueryParseError,

    // Generic
    /// Unknown error.
    Unknown,
}

impl GitHubErrorKind {
    /// Returns true for failures below the HTTP layer.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed
                | Self::Timeout
                | Self::DnsResolutionFailed
                | Self::TlsError
                | Self::TooManyRedirects
                | Self::UnsupportedScheme
        )
    }

    /// Returns true if the caller's context ended the call.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl fmt::Display for GitHubErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidBaseUrl => "invalid_base_url",
            Self::InvalidAppCredentials => "invalid_app_credentials",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::BadCredentials => "bad_credentials",
            Self::AppAuthenticationFailed => "app_auth_failed",
            Self::ValidationError => "validation_error",
            Self::InvalidParameter => "invalid_parameter",
            Self::UnprocessableEntity => "unprocessable_entity",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::UnavailableForLegalReasons => "unavailable_for_legal_reasons",
            Self::TooManyRequests => "too_many_requests",
            Self::InternalRateLimitExceeded => "internal_rate_limit_exceeded",
            Self::ConnectionFailed => "connection_failed",
            Self::Timeout => "timeout",
            Self::DnsResolutionFailed => "dns_resolution_failed",
            Self::TlsError => "tls_error",
            Self::TooManyRedirects => "too_many_redirects",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::LockUnavailable => "lock_unavailable",
            Self::InternalError => "internal_error",
            Self::BadGateway => "bad_gateway",
            Self::ServiceUnavailable => "service_unavailable",
            Self::DeserializationError => "deserialization_error",
            Self::QueryError => "query_error",
            Self::QueryParseError => "query_parse_error",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Structured error payload returned by the GitHub REST API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Link to the relevant documentation page.
    #[serde(default)]
    pub documentation_url: Option<String>,
    /// Field-level validation errors.
    #[serde(default)]
    pub errors: Vec<ValidationDetail>,
}

/// A single validation error entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationDetail {
    /// Resource the error applies to.
    pub resource: Option<String>,
    /// Field the error applies to.
    pub field: Option<String>,
    /// Machine-readable code, e.g. `already_exists`.
    pub code: Option<String>,
    /// Free-form message.
    pub message: Option<String>,
}

impl ApiError {
    /// Decodes an error body, keeping a diagnostic message when the body is
    /// not the expected JSON shape. Only the first [`MAX_ERROR_BODY_BYTES`]
    /// bytes are considered.
    pub fn from_body(body: &[u8]) -> Self {
        let truncated = &body[..body.len().min(MAX_ERROR_BODY_BYTES)];
        match serde_json::from_slice::<ApiError>(truncated) {
            Ok(parsed) => parsed,
            Err(e) => Self {
                message: format!(
                    "failed to decode error response from GitHub API: {}: {:?}",
                    e,
                    String::from_utf8_lossy(truncated)
                ),
                ..Default::default()
            },
        }
    }
}

/// GitHub API error with detailed information.
#[derive(Error, Debug)]
pub struct GitHubError {
    /// Error kind.
    kind: GitHubErrorKind,
    /// Error message.
    message: String,
    /// HTTP status code.
    status_code: Option<u16>,
    /// URL of the failed request.
    url: Option<String>,
    /// GitHub request ID.
    request_id: Option<String>,
    /// Documentation URL.
    documentation_url: Option<String>,
    /// Validation details from the error body.
    details: Vec<ValidationDetail>,
    /// GraphQL errors, when the response carried any.
    graphql_errors: Vec<GraphQLError>,
    /// Number of transport attempts made before giving up.
    attempts: Option<u32>,
    /// Underlying cause.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for GitHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.url, self.status_code) {
            (Some(url), Some(code)) => write!(
                f,
                "[{}] request to {} returned status {}: {}",
                self.kind, url, code, self.message
            )?,
            _ => {
                write!(f, "[{}] {}", self.kind, self.message)?;
                if let Some(code) = self.status_code {
                    write!(f, " (HTTP {})", code)?;
                }
            }
        }
        if let Some(ref id) = self.request_id {
            write!(f, " [request_id: {}]", id)?;
        }
        if let Some(attempts) = self.attempts {
            write!(f, " after {} attempt(s)", attempts)?;
        }
        Ok(())
    }
}

impl GitHubError {
    /// Creates a new GitHub error.
    pub fn new(kind: GitHubErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            url: None,
            request_id: None,
            documentation_url: None,
            details: Vec::new(),
            graphql_errors: Vec::new(),
            attempts: None,
            cause: None,
        }
    }

    /// Sets the HTTP status code.
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Sets the request URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the GitHub request ID.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Sets the documentation URL.
    pub fn with_documentation_url(mut self, url: impl Into<String>) -> Self {
        self.documentation_url = Some(url.into());
        self
    }

    /// Records how many attempts the transport made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Gets the error kind.
    pub fn kind(&self) -> &GitHubErrorKind {
        &self.kind
    }

    /// Gets the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Gets the HTTP status code.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Gets the URL of the failed request.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Gets the request ID.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Gets the documentation URL.
    pub fn documentation_url(&self) -> Option<&str> {
        self.documentation_url.as_deref()
    }

    /// Gets the validation details.
    pub fn details(&self) -> &[ValidationDetail] {
        &self.details
    }

    /// Gets the GraphQL errors.
    pub fn graphql_errors(&self) -> &[GraphQLError] {
        &self.graphql_errors
    }

    /// Gets the number of transport attempts, if recorded.
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    /// Creates an error from a non-success HTTP response.
    pub fn from_api_error(
        url: impl Into<String>,
        status: u16,
        api_error: ApiError,
        request_id: Option<String>,
    ) -> Self {
        let mut error = Self::new(Self::kind_from_status(status), api_error.message)
            .with_status(status)
            .with_url(url);
        error.details = api_error.errors;
        error.documentation_url = api_error.documentation_url;
        error.request_id = request_id;
        error
    }

    /// Creates an error wrapping GraphQL response errors.
    pub fn graphql(errors: Vec<GraphQLError>) -> Self {
        let message = match errors.as_slice() {
            [] => "GraphQL response contained errors".to_string(),
            [single] => format!("error in GraphQL response: {}", single.message),
            many => {
                let joined = many
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("{} errors in GraphQL response: {}", many.len(), joined)
            }
        };
        let mut error = Self::new(GitHubErrorKind::QueryError, message);
        error.graphql_errors = errors;
        error
    }

    /// Maps HTTP status code to error kind.
    fn kind_from_status(status: u16) -> GitHubErrorKind {
        match status {
            400 => GitHubErrorKind::ValidationError,
            401 => GitHubErrorKind::BadCredentials,
            403 => GitHubErrorKind::Forbidden,
            404 => GitHubErrorKind::NotFound,
            409 => GitHubErrorKind::Conflict,
            410 => GitHubErrorKind::Gone,
            422 => GitHubErrorKind::UnprocessableEntity,
            429 => GitHubErrorKind::TooManyRequests,
            451 => GitHubErrorKind::UnavailableForLegalReasons,
            500 => GitHubErrorKind::InternalError,
            502 => GitHubErrorKind::BadGateway,
            503 => GitHubErrorKind::ServiceUnavailable,
            _ => GitHubErrorKind::Unknown,
        }
    }

    // Classification

    /// Returns true for a 401 response.
    pub fn is_unauthorized(&self) -> bool {
        self.status_code == Some(401)
    }

    /// Returns true for a 403 response. GitHub uses 403 for both permission
    /// errors and rate limits.
    pub fn is_forbidden(&self) -> bool {
        self.status_code == Some(403)
    }

    /// Returns true if the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status_code == Some(404)
            || self
                .graphql_errors
                .iter()
                .any(|e| e.error_type.as_deref() == Some("NOT_FOUND"))
    }

    /// Returns true if the target repository is archived.
    pub fn is_archived(&self) -> bool {
        self.mentions("archived so is read-only")
    }

    /// Returns true if the resource the caller tried to create already exists.
    pub fn is_already_exists(&self) -> bool {
        self.details
            .iter()
            .any(|d| d.code.as_deref() == Some("already_exists"))
            || self.mentions("already exists")
    }

    /// Returns true if the account behind the credential was suspended.
    pub fn is_account_suspended(&self) -> bool {
        self.is_forbidden() && self.message.contains("account was suspended")
    }

    /// Returns true for a 451 response.
    pub fn is_unavailable_for_legal_reasons(&self) -> bool {
        self.status_code == Some(451)
    }

    /// Returns true if the error looks like a primary or secondary rate limit.
    pub fn is_rate_limit_exceeded(&self) -> bool {
        if self.status_code == Some(429) {
            return true;
        }
        if self.is_forbidden() {
            let message = self.message.to_lowercase();
            if message.contains("api rate limit exceeded")
                || message.contains("secondary rate limit")
                || message.contains("abuse detection")
            {
                return true;
            }
        }
        self.graphql_errors
            .iter()
            .any(|e| e.error_type.as_deref() == Some("RATE_LIMITED"))
    }

    /// Returns true if the caller's context ended the call.
    pub fn is_cancelled(&self) -> bool {
        self.kind.is_context()
    }

    /// Returns true for failures below the HTTP layer.
    pub fn is_network(&self) -> bool {
        self.kind.is_network()
    }

    fn mentions(&self, needle: &str) -> bool {
        self.message.contains(needle) || self.graphql_errors.iter().any(|e| e.message.contains(needle))
    }

    // Convenience constructors

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::InvalidConfiguration, message)
    }

    /// Creates a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(GitHubErrorKind::Cancelled, "context canceled")
    }

    /// Creates a deadline error.
    pub fn deadline_exceeded() -> Self {
        Self::new(GitHubErrorKind::DeadlineExceeded, "context deadline exceeded")
    }

    /// Classifies a reqwest failure into a network error kind.
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        let chain = error_chain(&error);
        let kind = if error.is_timeout() {
            GitHubErrorKind::Timeout
        } else if error.is_redirect() {
            GitHubErrorKind::TooManyRedirects
        } else if error.is_builder() || chain.contains("scheme") {
            GitHubErrorKind::UnsupportedScheme
        } else if chain.contains("dns error") || chain.contains("failed to lookup address") {
            GitHubErrorKind::DnsResolutionFailed
        } else if chain.contains("certificate") || chain.contains("unknownissuer") {
            GitHubErrorKind::TlsError
        } else {
            GitHubErrorKind::ConnectionFailed
        };
        Self::new(kind, format!("request failed: {}", error)).with_cause(error)
    }
}

/// Lower-cased concatenation of every message in an error's source chain.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut messages = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        messages.push(cause.to_string());
        source = cause.source();
    }
    messages.join(": ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16, body: &str) -> GitHubError {
        GitHubError::from_api_error(
            "https://api.github.com/repos/o/r",
            status,
            ApiError::from_body(body.as_bytes()),
            None,
        )
    }

    #[test]
    fn test_error_display() {
        let error = api_error(404, r#"{"message":"Not Found"}"#).with_request_id("abc123");

        let display = format!("{}", error);
        assert!(display.contains("not_found"));
        assert!(display.contains("returned status 404: Not Found"));
        assert!(display.contains("abc123"));
    }

    #[test]
    fn test_from_api_error_keeps_documentation_url() {
        let error = api_error(
            403,
            r#"{"message":"Forbidden","documentation_url":"https://docs.github.com"}"#,
        );

        assert_eq!(*error.kind(), GitHubErrorKind::Forbidden);
        assert_eq!(error.status_code(), Some(403));
        assert_eq!(error.documentation_url(), Some("https://docs.github.com"));
        assert_eq!(error.url(), Some("https://api.github.com/repos/o/r"));
    }

    #[test]
    fn test_undecodable_body_keeps_diagnostic() {
        let error = api_error(502, "<html>bad gateway</html>");
        assert!(error.message().contains("failed to decode error response"));
        assert!(error.message().contains("bad gateway"));
    }

    #[test]
    fn test_classification() {
        assert!(api_error(401, r#"{"message":"Bad credentials"}"#).is_unauthorized());
        assert!(api_error(
            403,
            r#"{"message":"Sorry. Your account was suspended."}"#
        )
        .is_account_suspended());
        assert!(api_error(
            403,
            r#"{"message":"Repository was archived so is read-only."}"#
        )
        .is_archived());
        assert!(api_error(
            422,
            r#"{"message":"Validation Failed","errors":[{"resource":"PullRequest","code":"custom","message":"A pull request already exists for o:branch."}]}"#
        )
        .details()
        .iter()
        .any(|d| d.message.as_deref().unwrap_or_default().contains("already exists")));
        assert!(api_error(
            422,
            r#"{"message":"Validation Failed","errors":[{"resource":"Label","code":"already_exists"}]}"#
        )
        .is_already_exists());
        assert!(api_error(451, r#"{"message":"Repository access blocked"}"#)
            .is_unavailable_for_legal_reasons());
    }

    #[test]
    fn test_rate_limit_classification() {
        assert!(api_error(403, r#"{"message":"API rate limit exceeded for user"}"#)
            .is_rate_limit_exceeded());
        assert!(api_error(403, r#"{"message":"You have exceeded a secondary rate limit."}"#)
            .is_rate_limit_exceeded());
        assert!(api_error(429, r#"{"message":"slow down"}"#).is_rate_limit_exceeded());
        assert!(!api_error(403, r#"{"message":"Resource not accessible by integration"}"#)
            .is_rate_limit_exceeded());
    }

    #[test]
    fn test_graphql_classification() {
        let error = GitHubError::graphql(vec![GraphQLError {
            message: "Could not resolve to a Repository with the name 'o/missing'.".to_string(),
            error_type: Some("NOT_FOUND".to_string()),
            path: Some(vec!["repository".to_string()]),
            locations: None,
            extensions: None,
        }]);

        assert_eq!(*error.kind(), GitHubErrorKind::QueryError);
        assert!(error.is_not_found());
        assert!(!error.is_rate_limit_exceeded());
        assert!(error.message().starts_with("error in GraphQL response"));
    }

    #[test]
    fn test_attempts_in_display() {
        let error = GitHubError::new(GitHubErrorKind::ConnectionFailed, "refused").with_attempts(4);
        assert!(error.to_string().ends_with("after 4 attempt(s)"));
        assert!(error.is_network());
        assert!(!error.is_cancelled());
        assert!(GitHubError::deadline_exceeded().is_cancelled());
    }
}
