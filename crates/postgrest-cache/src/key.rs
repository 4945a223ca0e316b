use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Prefix on every key so cache entries don't collide with other data in
/// the same store.
pub const KEY_NAMESPACE: &str = "postgrest:";

/// Request headers that change what PostgREST returns, in key order.
pub const KEYED_HEADERS: [&str; 4] = ["Authorization", "Accept", "Content-Type", "Apikey"];

/// Query parameter name -> every value given for it.
pub type QueryParams = BTreeMap<String, Vec<String>>;

/// Group decoded `(name, value)` query pairs by name, keeping repeats.
pub fn group_query<I, K, V>(pairs: I) -> QueryParams
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut params = QueryParams::new();
    for (name, value) in pairs {
        params.entry(name.into()).or_default().push(value.into());
    }
    params
}

/// Derive the cache key for a request.
///
/// Components are the path, then `name=v1,v2` for each query parameter
/// (names and values sorted), then `Header=v1,v2` for each keyed header
/// that is present (values in request order), joined with `|` and hashed
/// with SHA-256.
pub fn cache_key(path: &str, query: &QueryParams, headers: &HeaderMap) -> String {
    let mut components = Vec::with_capacity(1 + query.len() + KEYED_HEADERS.len());
    components.push(path.to_owned());

    // BTreeMap iteration is already sorted by name
    for (name, values) in query {
        let mut values: Vec<&str> = values.iter().map(String::as_str).collect();
        values.sort_unstable();
        components.push(format!("{}={}", name, values.join(",")));
    }

    for header in KEYED_HEADERS {
        let values: Vec<String> = headers
            .get_all(header)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        if !values.is_empty() {
            components.push(format!("{}={}", header, values.join(",")));
        }
    }

    let digest = Sha256::digest(components.join("|").as_bytes());
    format!("{KEY_NAMESPACE}{digest:x}")
}
