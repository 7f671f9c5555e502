use std::borrow::Cow;

const JWT_PREFIX: &str = "eyJ";

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' || ch == '%'
}

/// Redacts the value of `token=` query parameters (streaming URLs carry
/// the access token there).
pub fn redact_query_token(input: &str) -> Cow<'_, str> {
    const KEY: &str = "token=";
    if !input.contains(KEY) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find(KEY) {
        out.push_str(&rest[..idx + KEY.len()]);
        rest = &rest[idx + KEY.len()..];

        let mut consumed = 0;
        for ch in rest.chars() {
            if ch == '&' || ch == '#' || ch.is_whitespace() || ch == '"' {
                break;
            }
            consumed += ch.len_utf8();
        }
        out.push_str("REDACTED");
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn redact_jwts(input: String) -> String {
    if !input.contains(JWT_PREFIX) {
        return input;
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input.as_str();
    while let Some(idx) = rest.find(JWT_PREFIX) {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let consumed: usize = rest
            .chars()
            .take_while(|ch| is_token_char(*ch))
            .map(char::len_utf8)
            .sum();
        out.push_str("REDACTED");
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    out
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let nee = needle.as_bytes();
    if nee.is_empty() {
        return Some(0);
    }
    if nee.len() > hay.len() {
        return None;
    }

    (0..=hay.len() - nee.len()).find(|&i| {
        hay[i..i + nee.len()]
            .iter()
            .zip(nee)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

fn redact_bearer(text: String) -> String {
    const BEARER: &str = "bearer ";
    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    loop {
        let Some(idx) = find_ascii_case_insensitive(rest, BEARER) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..idx + BEARER.len()]);
        rest = &rest[idx + BEARER.len()..];

        let consumed: usize = rest
            .chars()
            .take_while(|ch| is_token_char(*ch))
            .map(char::len_utf8)
            .sum();
        if consumed > 0 {
            out.push_str("REDACTED");
        }
        rest = &rest[consumed..];
    }
    out
}

/// Scrubs credentials out of text that is about to be logged or returned
/// as an error message.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let value = redact_query_token(input).into_owned();
    let value = redact_bearer(value);
    let value = redact_jwts(value);

    if value == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(value)
    }
}
