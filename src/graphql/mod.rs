//! GraphQL wire types for GitHub's v4 API.

pub mod cost;

pub use cost::estimate;

use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// GraphQL request payload: `{"query": ..., "variables": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQLRequest {
    /// The GraphQL document.
    pub query: String,
    /// Variables; serialized as `{}` when empty.
    pub variables: serde_json::Map<String, serde_json::Value>,
}

impl GraphQLRequest {
    /// Creates a request without variables.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: serde_json::Map::new(),
        }
    }

    /// Sets the variables. Non-object values are ignored.
    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = variables {
            self.variables = map;
        }
        self
    }
}

/// Decoded GraphQL response.
///
/// `data` is decoded even when `errors` is not empty, since GitHub returns
/// partial results next to per-field errors.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphQLResponse<T> {
    /// Response data, possibly partial.
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    /// Errors reported next to the data.
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

impl<T> GraphQLResponse<T> {
    /// Returns true if the response contains errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the data or an error if not present.
    pub fn data(&self) -> GitHubResult<&T> {
        self.data.as_ref().ok_or_else(|| {
            GitHubError::new(
                GitHubErrorKind::QueryError,
                "GraphQL response contains no data",
            )
        })
    }

    /// Returns the data only if the response carried no errors.
    pub fn into_result(self) -> GitHubResult<T> {
        if !self.errors.is_empty() {
            return Err(GitHubError::graphql(self.errors));
        }
        self.data.ok_or_else(|| {
            GitHubError::new(
                GitHubErrorKind::QueryError,
                "GraphQL response contains no data",
            )
        })
    }

    /// Maps the data to a different type.
    pub fn map<U, F>(self, f: F) -> GraphQLResponse<U>
    where
        F: FnOnce(T) -> U,
    {
        GraphQLResponse {
            data: self.data.map(f),
            errors: self.errors,
        }
    }
}

/// GraphQL error item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// Error message.
    pub message: String,
    /// Error type (e.g., "RATE_LIMITED", "NOT_FOUND").
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    /// Path to the field that caused the error. List indices become strings.
    #[serde(default, deserialize_with = "deserialize_path")]
    pub path: Option<Vec<String>>,
    /// Source locations in the query.
    #[serde(default)]
    pub locations: Option<Vec<GraphQLLocation>>,
    /// Additional error extensions.
    #[serde(default)]
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

fn deserialize_path<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw.map(|segments| {
        segments
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }))
}

/// Location in GraphQL query source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}
