pub mod bytes;
pub mod http_request;
pub mod http_response;
pub mod http_stream;

use percent_encoding::percent_decode_str;

use crate::helpers::HeaderList;

/// Split `line` into at most `max_tokens` tokens.
///
/// Tokens are separated by runs of whitespace and, when given, by
/// `delimiter`. Once `max_tokens - 1` tokens have been taken the final token
/// is the untouched remainder of the line, so a request line with trailing
/// garbage yields a version token that fails to parse.
pub fn tokenize(line: &str, delimiter: Option<char>, max_tokens: usize) -> Vec<&str> {
    let is_sep = |c: char| (c as u32) < 33 || Some(c) == delimiter;
    let mut tokens = Vec::new();
    let mut rest = line;

    while tokens.len() < max_tokens {
        rest = rest.trim_start_matches(is_sep);
        if rest.is_empty() {
            break;
        }
        if tokens.len() + 1 == max_tokens {
            tokens.push(rest.trim_end_matches(is_sep));
            break;
        }
        let end = rest.find(is_sep).unwrap_or(rest.len());
        tokens.push(&rest[..end]);
        rest = &rest[end..];
    }
    tokens
}

/// Decode `a=1&b=two+words` style arguments into `args`.
///
/// Keys and values are percent-decoded with `+` read as a space; a pair
/// without `=` is stored with an empty value.
pub fn parse_uri_args(args: &mut HeaderList, query: &str) {
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        args.add(url_decode(key), url_decode(value));
    }
}

fn url_decode(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}
