//! `key="value"` parameter lists, as found in `WWW-Authenticate` and
//! `Key-Exchange` headers.

use std::collections::HashMap;

/// Parses `a="x", b=y c="z"` style parameter lists.
///
/// Pairs may be separated by commas or whitespace; quoted values may contain
/// either. A leading scheme token such as `Digest` is ignored. Keys are
/// lower-cased.
pub fn parse_params(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b',' || bytes[i].is_ascii_whitespace()) {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let key = &input[key_start..i];
        if i >= bytes.len() || bytes[i] != b'=' {
            // bare token (auth scheme), nothing to store
            continue;
        }
        i += 1; // '='

        let value = if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let v = &input[start..i];
            i += 1; // closing quote
            v
        } else {
            let start = i;
            while i < bytes.len() && bytes[i] != b',' && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            &input[start..i]
        };

        if !key.is_empty() {
            out.insert(key.to_ascii_lowercase(), value.to_string());
        }
    }
    out
}

/// Extracts `boundary=...` from a `multipart/mixed` content type.
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}
