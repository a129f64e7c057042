//! `Link` header pagination (RFC 8288) as GitHub's REST API emits it.

use reqwest::header::{HeaderMap, LINK};
use std::collections::HashMap;
use url::Url;

/// Relation targets parsed from a `Link` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationLinks {
    targets: HashMap<String, String>,
}

impl PaginationLinks {
    /// Parses a `Link` header value. Malformed entries are skipped.
    pub fn parse(value: &str) -> Self {
        let mut targets = HashMap::new();
        for entry in value.split(',') {
            let mut params = entry.split(';').map(str::trim);
            let Some(target) = params
                .next()
                .and_then(|t| t.strip_prefix('<'))
                .and_then(|t| t.strip_suffix('>'))
            else {
                continue;
            };
            for param in params {
                let Some(rels) = param.strip_prefix("rel=") else {
                    continue;
                };
                for rel in rels.trim_matches('"').split_whitespace() {
                    targets
                        .entry(rel.to_ascii_lowercase())
                        .or_insert_with(|| target.to_string());
                }
            }
        }
        Self { targets }
    }

    /// Parses the `Link` header of a response, if any.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .map(Self::parse)
            .unwrap_or_default()
    }

    /// URL for relation `rel`.
    pub fn get(&self, rel: &str) -> Option<&str> {
        self.targets.get(rel).map(String::as_str)
    }

    /// URL of the next page.
    pub fn next(&self) -> Option<&str> {
        self.get("next")
    }

    /// Returns true if there is a next page.
    pub fn has_next(&self) -> bool {
        self.next().is_some()
    }

    /// Page number of the `last` relation.
    pub fn last_page(&self) -> Option<u32> {
        let last = Url::parse(self.get("last")?).ok()?;
        let page = last
            .query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok());
        page
    }
}

/// One page of a list endpoint.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in this page.
    pub items: Vec<T>,
    /// Links to neighbouring pages.
    pub links: PaginationLinks,
}

impl<T> Page<T> {
    /// Creates a page.
    pub fn new(items: Vec<T>, links: PaginationLinks) -> Self {
        Self { items, links }
    }

    /// Returns true if there is a next page.
    pub fn has_next(&self) -> bool {
        self.links.has_next()
    }

    /// URL of the next page.
    pub fn next_url(&self) -> Option<&str> {
        self.links.next()
    }

    /// Number of items in this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the page is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> IntoIterator for Page<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    const LINK_VALUE: &str = r#"<https://api.github.com/user/repos?page=3&per_page=100>; rel="next", <https://api.github.com/user/repos?page=50&per_page=100>; rel="last""#;

    #[test]
    fn test_parse_links() {
        let links = PaginationLinks::parse(LINK_VALUE);
        assert_eq!(
            links.next(),
            Some("https://api.github.com/user/repos?page=3&per_page=100")
        );
        assert!(links.has_next());
        assert_eq!(links.last_page(), Some(50));
        assert_eq!(links.get("prev"), None);
    }

    #[test]
    fn test_last_page_has_no_next() {
        let links = PaginationLinks::parse(
            r#"<https://api.github.com/user/repos?page=1>; rel="first", <https://api.github.com/user/repos?page=49>; rel="prev""#,
        );
        assert!(!links.has_next());
        assert!(links.get("first").is_some());
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(!PaginationLinks::from_headers(&headers).has_next());

        headers.insert(LINK, HeaderValue::from_static(LINK_VALUE));
        assert!(PaginationLinks::from_headers(&headers).has_next());
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let links = PaginationLinks::parse(r#"garbage; rel="next", <https://x/?page=2>; rel=next"#);
        assert_eq!(links.next(), Some("https://x/?page=2"));
    }

    #[test]
    fn test_page_iteration() {
        let page = Page::new(vec![1, 2, 3], PaginationLinks::default());
        assert_eq!(page.len(), 3);
        assert!(!page.has_next());
        assert_eq!(page.into_iter().sum::<i32>(), 6);
    }
}
