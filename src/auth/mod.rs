//! Authentication mechanisms for GitHub API.
//!
//! Besides producing the `Authorization` header, every credential exposes a
//! one-way [`hash`](AuthMethod::hash) used to key rate-limit monitors and
//! concurrency locks without retaining the secret itself.

use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Authentication method for GitHub API.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Personal Access Token (classic or fine-grained).
    Pat(SecretString),
    /// GitHub App authentication.
    App(AppAuth),
    /// OAuth token.
    OAuth(SecretString),
    /// GitHub Actions token (from GITHUB_TOKEN).
    Actions(SecretString),
    /// No credential. Requests are sent unauthenticated.
    Anonymous,
}

impl AuthMethod {
    /// Creates a PAT authentication method.
    pub fn pat(token: impl Into<String>) -> Self {
        Self::Pat(SecretString::new(token.into()))
    }

    /// Creates an OAuth authentication method.
    pub fn oauth(token: impl Into<String>) -> Self {
        Self::OAuth(SecretString::new(token.into()))
    }

    /// Creates a GitHub Actions token authentication method.
    pub fn actions(token: impl Into<String>) -> Self {
        Self::Actions(SecretString::new(token.into()))
    }

    /// Creates a GitHub App authentication method.
    pub fn app(app_id: u64, private_key: impl Into<String>) -> Self {
        Self::App(AppAuth {
            app_id,
            private_key: SecretString::new(private_key.into()),
        })
    }

    /// Gets the token prefix for logging.
    pub fn token_prefix(&self) -> &'static str {
        match self {
            Self::Pat(t) => {
                let exposed = t.expose_secret();
                if exposed.starts_with("ghp_") {
                    "ghp_***"
                } else if exposed.starts_with("github_pat_") {
                    "github_pat_***"
                } else {
                    "***"
                }
            }
            Self::OAuth(_) => "gho_***",
            Self::Actions(_) => "ghs_***",
            Self::App(_) => "app_jwt",
            Self::Anonymous => "anonymous",
        }
    }

    /// Generates the Authorization header value, or `None` when anonymous.
    pub fn header(&self) -> GitHubResult<Option<String>> {
        match self {
            Self::Pat(token) | Self::OAuth(token) | Self::Actions(token) => {
                Ok(Some(format!("Bearer {}", token.expose_secret())))
            }
            Self::App(app) => Ok(Some(format!("Bearer {}", app.generate_jwt()?))),
            Self::Anonymous => Ok(None),
        }
    }

    /// Hex-encoded SHA-256 of the credential material.
    ///
    /// Two clients holding the same token produce the same hash and therefore
    /// share one rate-limit monitor and one concurrency lock.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Self::Pat(token) | Self::OAuth(token) | Self::Actions(token) => {
                hasher.update(token.expose_secret().as_bytes());
            }
            Self::App(app) => {
                hasher.update(app.app_id.to_string().as_bytes());
                hasher.update(b":");
                hasher.update(app.private_key.expose_secret().as_bytes());
            }
            Self::Anonymous => {}
        }
        hex::encode(hasher.finalize())
    }
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::Anonymous
    }
}

/// GitHub App authentication configuration.
#[derive(Debug, Clone)]
pub struct AppAuth {
    /// GitHub App ID.
    pub app_id: u64,
    /// Private key (PEM format).
    pub private_key: SecretString,
}

/// JWT claims for GitHub App authentication.
#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    /// Issued at (Unix timestamp).
    iat: i64,
    /// Expiration (Unix timestamp).
    exp: i64,
    /// Issuer (App ID).
    iss: String,
}

impl AppAuth {
    /// Generates a JWT for GitHub App authentication.
    fn generate_jwt(&self) -> GitHubResult<String> {
        let now = Utc::now();
        // 60 seconds in the past for clock drift
        let iat = (now - Duration::seconds(60)).timestamp();
        // max allowed is 10 minutes
        let exp = (now + Duration::minutes(9)).timestamp();

        let claims = JwtClaims {
            iat,
            exp,
            iss: self.app_id.to_string(),
        };

        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| {
                GitHubError::new(
                    GitHubErrorKind::InvalidAppCredentials,
                    format!("Failed to parse private key: {}", e),
                )
            })?;

        encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::AppAuthenticationFailed,
                format!("Failed to generate JWT: {}", e),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pat_auth() {
        let auth = AuthMethod::pat("ghp_xxxxxxxxxxxx");
        assert_eq!(auth.token_prefix(), "ghp_***");
        assert_eq!(
            auth.header().unwrap().as_deref(),
            Some("Bearer ghp_xxxxxxxxxxxx")
        );
    }

    #[test]
    fn test_anonymous_has_no_header() {
        assert_eq!(AuthMethod::Anonymous.header().unwrap(), None);
    }

    #[test]
    fn test_app_with_bad_key() {
        let err = AuthMethod::app(12345, "not a pem").header().unwrap_err();
        assert_eq!(*err.kind(), GitHubErrorKind::InvalidAppCredentials);
    }

    #[test]
    fn test_hash_is_stable_and_opaque() {
        let a = AuthMethod::pat("ghp_secret");
        let b = AuthMethod::oauth("ghp_secret");
        let c = AuthMethod::pat("ghp_other");

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);
        assert!(!a.hash().contains("secret"));
    }
}
