//! Query-string parsing for the binder.

use std::collections::HashMap;

use crate::helpers::http::decode_form_component;

/// Decoded query parameters: each key maps to every value supplied for it,
/// in the order the values appeared.
pub(crate) type QueryMap = HashMap<String, Vec<String>>;

/// Parses a raw query string into a [`QueryMap`].
///
/// Pairs are separated by `&` or `;`. A key without `=` carries no value and
/// is dropped, as is any pair whose key or value fails to decode.
pub(crate) fn parse(query: Option<&str>) -> QueryMap {
    let mut map = QueryMap::new();

    for pair in query.unwrap_or_default().split(separator) {
        let (key, value) = match pair.split_once('=') {
            Some(split) => split,
            None => continue,
        };
        if let (Some(key), Some(value)) = (decode_form_component(key), decode_form_component(value))
        {
            map.entry(key).or_default().push(value);
        }
    }

    map
}

fn separator(c: char) -> bool {
    c == '&' || c == ';'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_keys_collect_values_in_order() {
        let map = parse(Some("tag=rust&limit=10&tag=web"));

        assert_eq!(map["tag"], vec!["rust", "web"]);
        assert_eq!(map["limit"], vec!["10"]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn semicolons_separate_and_bare_keys_drop() {
        let map = parse(Some("a=1;verbose;b=2"));

        assert_eq!(map["a"], vec!["1"]);
        assert_eq!(map["b"], vec!["2"]);
        assert!(!map.contains_key("verbose"));
    }

    #[test]
    fn values_decode_and_keep_embedded_equals() {
        let map = parse(Some("q=size%3Dlarge+blue&path=%2Ftmp"));

        assert_eq!(map["q"], vec!["size=large blue"]);
        assert_eq!(map["path"], vec!["/tmp"]);
    }

    #[test]
    fn missing_query_yields_an_empty_map() {
        assert!(parse(None).is_empty());
        assert!(parse(Some("")).is_empty());
    }
}
