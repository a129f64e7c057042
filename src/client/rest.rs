//! REST (v3) request strategy.

use super::orchestrator::{decode_json, RequestStrategy};
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::pagination::PaginationLinks;
use crate::transport::{HttpRequest, HttpResponse};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// Joins `path` onto the base URL, keeping the base path.
///
/// `https://ghe.example.com/api/v3` + `user/repos` gives
/// `https://ghe.example.com/api/v3/user/repos`. Absolute URLs, such as
/// pagination links, are used as given.
pub fn rest_url(base: &Url, path: &str) -> GitHubResult<Url> {
    if path.starts_with("https://") || path.starts_with("http://") {
        return Url::parse(path).map_err(|e| invalid_path(path, e));
    }
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| invalid_path(path, e))
}

fn invalid_path(path: &str, e: url::ParseError) -> GitHubError {
    GitHubError::new(
        GitHubErrorKind::InvalidParameter,
        format!("invalid request path {:?}: {}", path, e),
    )
}

/// A REST call: method, URL, headers and an optional JSON body.
pub struct RestCall {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RestCall {
    /// Creates a call with the client's standard headers.
    pub fn new(method: Method, url: Url, headers: HeaderMap) -> Self {
        Self {
            method,
            url,
            headers,
            body: None,
        }
    }

    /// Sets a pre-serialized JSON body.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

impl RequestStrategy for RestCall {
    type Output = RestResponse;

    fn build_request(&self) -> GitHubResult<HttpRequest> {
        let mut request = HttpRequest::new(self.method.clone(), self.url.clone());
        request.headers = self.headers.clone();
        if let Some(body) = &self.body {
            request = request.with_body(body.clone());
        }
        Ok(request)
    }

    fn cost(&self) -> u32 {
        1
    }

    fn interpret_response(&self, response: HttpResponse) -> GitHubResult<Self::Output> {
        Ok(RestResponse::from(response))
    }
}

/// Successful REST response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    inner: HttpResponse,
}

impl From<HttpResponse> for RestResponse {
    fn from(mut inner: HttpResponse) -> Self {
        if inner.status == StatusCode::NOT_MODIFIED {
            inner.body = Bytes::new();
        }
        Self { inner }
    }
}

impl RestResponse {
    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.inner.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// Raw body. Empty for 304.
    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    /// Final URL.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.header(name)
    }

    /// Returns true for 304 Not Modified.
    pub fn is_not_modified(&self) -> bool {
        self.inner.status == StatusCode::NOT_MODIFIED
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> GitHubResult<T> {
        decode_json(&self.inner)
    }

    /// Pagination links of the response.
    pub fn links(&self) -> PaginationLinks {
        PaginationLinks::from_headers(&self.inner.headers)
    }

    /// Returns true if the `Link` header has a `rel="next"` target.
    pub fn has_next_page(&self) -> bool {
        self.links().has_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, LINK};
    use test_case::test_case;

    #[test_case("https://api.github.com", "/repos/o/r", "https://api.github.com/repos/o/r" ; "root base")]
    #[test_case("https://api.github.com/", "repos/o/r", "https://api.github.com/repos/o/r" ; "trailing slash")]
    #[test_case("https://ghe.example.com/api/v3", "user/repos", "https://ghe.example.com/api/v3/user/repos" ; "enterprise base path")]
    #[test_case("https://ghe.example.com/api/v3", "/user/repos?per_page=100", "https://ghe.example.com/api/v3/user/repos?per_page=100" ; "query string kept")]
    #[test_case("https://api.github.com", "https://api.github.com/user/repos?page=2", "https://api.github.com/user/repos?page=2" ; "absolute link")]
    fn test_rest_url(base: &str, path: &str, want: &str) {
        let base = Url::parse(base).unwrap();
        assert_eq!(rest_url(&base, path).unwrap().as_str(), want);
    }

    fn response(status: u16, body: &'static str) -> HttpResponse {
        HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            url: Url::parse("https://api.github.com/x").unwrap(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn test_not_modified_has_empty_body() {
        let response = RestResponse::from(response(304, "stale"));
        assert!(response.is_not_modified());
        assert!(response.body().is_empty());
    }

    #[test]
    fn test_json_and_links() {
        let mut raw = response(200, r#"[{"id":1},{"id":2}]"#);
        raw.headers.insert(
            LINK,
            HeaderValue::from_static(r#"<https://api.github.com/x?page=2>; rel="next""#),
        );
        let response = RestResponse::from(raw);

        let items: Vec<serde_json::Value> = response.json().unwrap();
        assert_eq!(items.len(), 2);
        assert!(response.has_next_page());
    }

    #[test]
    fn test_bad_json_is_deserialization_error() {
        let err = RestResponse::from(response(200, "not json"))
            .json::<serde_json::Value>()
            .unwrap_err();
        assert_eq!(*err.kind(), GitHubErrorKind::DeserializationError);
    }

    #[test]
    fn test_build_request_is_repeatable() {
        let call = RestCall::new(
            Method::POST,
            Url::parse("https://api.github.com/x").unwrap(),
            HeaderMap::new(),
        )
        .with_body(Bytes::from_static(b"{}"));
        let a = call.build_request().unwrap();
        let b = call.build_request().unwrap();
        assert_eq!(a.body.as_bytes(), b.body.as_bytes());
        assert_eq!(call.cost(), 1);
    }
}
