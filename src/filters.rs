//! Built-in expression filters.

use phf::phf_map;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuiltinFilter {
    Html,
    Xml,
    Url,
    Trim,
    Str,
    Entity,
}

pub(crate) static FILTERS: phf::Map<&'static str, BuiltinFilter> = phf_map! {
    "h" => BuiltinFilter::Html,
    "x" => BuiltinFilter::Xml,
    "u" => BuiltinFilter::Url,
    "trim" => BuiltinFilter::Trim,
    "str" => BuiltinFilter::Str,
    "entity" => BuiltinFilter::Entity,
};

/// The filter name that switches off default filters for one expression.
pub(crate) const NO_DEFAULTS: &str = "n";

impl BuiltinFilter {
    pub(crate) fn apply(self, value: &Value) -> Value {
        let text = value.to_string();
        let filtered = match self {
            BuiltinFilter::Html => html_escape(&text),
            BuiltinFilter::Xml => xml_escape(&text),
            BuiltinFilter::Url => url_escape(&text),
            BuiltinFilter::Trim => text.trim().to_string(),
            BuiltinFilter::Str => return Value::from(text),
            BuiltinFilter::Entity => entity_escape(&text),
        };
        Value::from(filtered)
    }
}

/// Escapes text for inclusion in HTML content or attribute values.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encodes UTF-8 text for a URL query component, with spaces as `+`.
pub fn url_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' => {
                out.push(char::from(byte));
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

static ENTITY_NAMES: phf::Map<char, &'static str> = phf_map! {
    '&' => "amp",
    '<' => "lt",
    '>' => "gt",
    '"' => "quot",
    '\u{a0}' => "nbsp",
    '\u{a9}' => "copy",
    '\u{ae}' => "reg",
    '\u{b0}' => "deg",
    '\u{b7}' => "middot",
    '\u{d7}' => "times",
    '\u{e0}' => "agrave",
    '\u{e1}' => "aacute",
    '\u{e7}' => "ccedil",
    '\u{e8}' => "egrave",
    '\u{e9}' => "eacute",
    '\u{f1}' => "ntilde",
    '\u{f6}' => "ouml",
    '\u{fc}' => "uuml",
    '\u{2013}' => "ndash",
    '\u{2014}' => "mdash",
    '\u{2018}' => "lsquo",
    '\u{2019}' => "rsquo",
    '\u{201c}' => "ldquo",
    '\u{201d}' => "rdquo",
    '\u{2026}' => "hellip",
    '\u{20ac}' => "euro",
    '\u{2122}' => "trade",
};

/// Replaces markup characters and non-ASCII characters with named
/// entities where one exists, numeric character references otherwise.
pub fn entity_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if let Some(name) = ENTITY_NAMES.get(&c) {
            out.push('&');
            out.push_str(name);
            out.push(';');
        } else if c.is_ascii() {
            out.push(c);
        } else {
            out.push_str(&format!("&#{};", u32::from(c)));
        }
    }
    out
}
