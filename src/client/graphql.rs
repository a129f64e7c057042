//! GraphQL (v4) request strategy.

use super::orchestrator::{decode_json, RequestStrategy};
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::graphql::{self, GraphQLRequest, GraphQLResponse};
use crate::transport::{HttpRequest, HttpResponse};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use url::Url;

/// GraphQL endpoint for a REST base URL.
///
/// Enterprise bases end in `/api/v3` and serve GraphQL at `/api/graphql`;
/// anything else gets `graphql` appended.
pub fn graphql_url(base: &Url) -> Url {
    let path = base.path().trim_end_matches('/');
    let endpoint = match path.strip_suffix("/v3") {
        Some(prefix) => format!("{}/graphql", prefix),
        None => format!("{}/graphql", path),
    };
    let mut url = base.clone();
    url.set_path(&endpoint);
    url.set_query(None);
    url
}

/// A GraphQL call decoding `data` into `T`.
pub struct GraphQLCall<T> {
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    cost: u32,
    _output: PhantomData<fn() -> T>,
}

impl<T> GraphQLCall<T> {
    /// Serializes `request` and estimates its cost.
    pub fn new(url: Url, headers: HeaderMap, request: &GraphQLRequest) -> GitHubResult<Self> {
        let cost = graphql::estimate(&request.query)?;
        let body = serde_json::to_vec(request).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::InvalidParameter,
                format!("serializing GraphQL request: {}", e),
            )
        })?;
        Ok(Self {
            url,
            headers,
            body: Bytes::from(body),
            cost,
            _output: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> RequestStrategy for GraphQLCall<T> {
    type Output = GraphQLResponse<T>;

    fn build_request(&self) -> GitHubResult<HttpRequest> {
        let mut request =
            HttpRequest::new(Method::POST, self.url.clone()).with_body(self.body.clone());
        request.headers = self.headers.clone();
        Ok(request)
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    fn interpret_response(&self, response: HttpResponse) -> GitHubResult<Self::Output> {
        if response.status == StatusCode::NOT_MODIFIED {
            return Ok(GraphQLResponse {
                data: None,
                errors: Vec::new(),
            });
        }
        let decoded: GraphQLResponse<T> = decode_json(&response)?;
        if decoded.has_errors() {
            tracing::debug!(
                url = %response.url,
                errors = decoded.errors.len(),
                "GraphQL response carried errors"
            );
        }
        Ok(decoded)
    }
}
