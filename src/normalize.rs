//! URL normalization.
//!
//! Canonicalizes URLs so that query parameter order never affects matching.

use url::form_urlencoded;

/// A URL split around its query string.
struct UrlParts<'a> {
    /// Scheme, authority and path, untouched.
    base: &'a str,
    query: Option<&'a str>,
    fragment: Option<&'a str>,
}

impl<'a> UrlParts<'a> {
    fn split(url: &'a str) -> Self {
        let (rest, fragment) = match url.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment)),
            None => (url, None),
        };
        let (base, query) = match rest.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (rest, None),
        };
        Self {
            base,
            query,
            fragment,
        }
    }

    fn pairs(&self) -> Vec<(String, String)> {
        self.query.map(parse_query).unwrap_or_default()
    }

    fn assemble(&self, pairs: &[(String, String)]) -> String {
        let mut out = String::with_capacity(self.base.len() + 16);
        out.push_str(self.base);
        if !pairs.is_empty() {
            out.push('?');
            out.push_str(&encode_query(pairs));
        }
        if let Some(fragment) = self.fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

/// Canonicalize a URL for equality comparison.
///
/// Query pairs are decoded, sorted by `(key, value)` and re-encoded; the
/// scheme, authority, path and fragment are preserved. Multi-valued keys keep
/// every value.
pub fn normalize(url: &str) -> String {
    let parts = UrlParts::split(url);
    let mut pairs = parts.pairs();
    pairs.sort();
    parts.assemble(&pairs)
}

/// Merge caller-supplied parameters into the query string of `url`.
///
/// Existing pairs whose key is not supplied are kept in place (including
/// multi-valued keys); pairs for supplied keys are replaced by the supplied
/// values, appended in the order given.
pub fn merge_params<K, V>(url: &str, params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if params.is_empty() {
        return url.to_string();
    }

    let parts = UrlParts::split(url);
    let mut pairs: Vec<(String, String)> = parts
        .pairs()
        .into_iter()
        .filter(|(key, _)| !params.iter().any(|(k, _)| k.as_ref() == key))
        .collect();
    pairs.extend(
        params
            .iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string())),
    );

    parts.assemble(&pairs)
}

/// Decode a query string into ordered key-value pairs.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn encode_query(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}
