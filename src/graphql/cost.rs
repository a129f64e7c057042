//! Static GraphQL cost estimation.
//!
//! Follows GitHub's published scoring: every connection costs as many requests
//! as its ancestors' page sizes multiply to, and the summed total is divided
//! by 100. The result is a pre-flight charge for the internal limiter; the
//! server's reported quota stays authoritative.

use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use graphql_parser::query::{
    parse_query, Definition, Field, OperationDefinition, Selection, SelectionSet, Value,
};

/// Arguments carrying a connection page size.
const LIMIT_ARGUMENTS: [&str; 2] = ["first", "last"];

/// Points per request in GitHub's scoring.
const REQUESTS_PER_POINT: u64 = 100;

/// Estimates the rate limit cost of `query`. Always at least 1.
pub fn estimate(query: &str) -> GitHubResult<u32> {
    let document = parse_query::<&str>(query).map_err(|e| {
        GitHubError::new(
            GitHubErrorKind::QueryParseError,
            format!("parsing GraphQL query: {}", e),
        )
    })?;

    let mut total: u64 = 0;
    for definition in &document.definitions {
        let selection_set = match definition {
            Definition::Operation(OperationDefinition::SelectionSet(set)) => set,
            Definition::Operation(OperationDefinition::Query(q)) => &q.selection_set,
            Definition::Operation(OperationDefinition::Mutation(m)) => &m.selection_set,
            Definition::Operation(OperationDefinition::Subscription(s)) => &s.selection_set,
            Definition::Fragment(f) => &f.selection_set,
        };
        let mut limits = Vec::new();
        total = total.saturating_add(walk(selection_set, &mut limits));
    }

    let points = (total / REQUESTS_PER_POINT).max(1);
    Ok(u32::try_from(points).unwrap_or(u32::MAX))
}

/// Sums the cost of every limited field under `set`.
///
/// `limits` holds the page sizes of the enclosing connections. It is restored
/// on return so siblings never see each other's limits.
fn walk<'a>(set: &SelectionSet<'a, &'a str>, limits: &mut Vec<u64>) -> u64 {
    let mut cost: u64 = 0;
    for selection in &set.items {
        match selection {
            Selection::Field(field) => {
                let depth = limits.len();
                if let Some(limit) = connection_limit(field) {
                    let requests = limits.iter().fold(1u64, |acc, l| acc.saturating_mul(*l));
                    cost = cost.saturating_add(requests);
                    limits.push(limit);
                }
                cost = cost.saturating_add(walk(&field.selection_set, limits));
                limits.truncate(depth);
            }
            Selection::InlineFragment(fragment) => {
                cost = cost.saturating_add(walk(&fragment.selection_set, limits));
            }
            // Named fragments are scored where they are defined.
            Selection::FragmentSpread(_) => {}
        }
    }
    cost
}

fn connection_limit<'a>(field: &Field<'a, &'a str>) -> Option<u64> {
    field.arguments.iter().find_map(|(name, value)| {
        if !LIMIT_ARGUMENTS.contains(name) {
            return None;
        }
        match value {
            Value::Int(n) => n.as_i64().and_then(|n| u64::try_from(n).ok()),
            _ => None,
        }
    })
}
