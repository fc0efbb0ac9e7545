use anyhow::{Context, Result, anyhow};
use log::debug;
use regex::Regex;
use serde::Deserialize;

use crate::models::Category;

/// Fields the model is told to emit as JSON strings; the quote-escaping
/// passes only touch the values of these.
const STRING_FIELDS: &str = "title|summary|comment|source|url|name|icon";

#[derive(Debug, Deserialize)]
struct CategoriesDoc {
    #[serde(default)]
    categories: Vec<Category>,
}

/// Parse model output into categories, repairing malformed JSON along the way.
///
/// The span from the first `{` to the last `}` is the candidate document.
/// Each pass is a pure function over that span, attempted only after the
/// previous one failed; the first success wins. Exhausting every pass is an
/// error — the caller decides whether that is fatal.
pub fn parse_categories(raw: &str) -> Result<Vec<Category>> {
    let span = extract_span(raw).ok_or_else(|| anyhow!("no JSON object found in response"))?;

    let passes: &[(&str, fn(&str) -> Result<Vec<Category>>)] = &[
        ("direct", pass_direct),
        ("field-quote escaping", pass_escape_quotes),
        ("trailing commas", pass_trailing_commas),
        ("categories isolation", pass_isolate_categories),
        ("line-by-line", pass_line_by_line),
    ];

    let mut last_err = None;
    for (name, pass) in passes {
        match pass(span) {
            Ok(categories) => {
                if last_err.is_some() {
                    debug!("JSON repaired by {name} pass");
                }
                return Ok(categories);
            }
            Err(e) => {
                debug!("JSON parse pass '{name}' failed: {e:#}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("empty repair chain")))
}

fn extract_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn parse_doc(text: &str) -> Result<Vec<Category>> {
    let doc: CategoriesDoc = serde_json::from_str(text).context("not valid JSON")?;
    Ok(doc.categories)
}

fn pass_direct(span: &str) -> Result<Vec<Category>> {
    parse_doc(span)
}

fn pass_escape_quotes(span: &str) -> Result<Vec<Category>> {
    parse_doc(&escape_field_quotes(&strip_control(span)))
}

fn pass_trailing_commas(span: &str) -> Result<Vec<Category>> {
    let cleaned = strip_trailing_commas(&escape_field_quotes(&strip_control(span)));
    parse_doc(&cleaned)
}

/// Ignore the envelope and parse only the `"categories": [...]` array.
fn pass_isolate_categories(span: &str) -> Result<Vec<Category>> {
    let cleaned = strip_trailing_commas(&escape_field_quotes(&strip_control(span)));
    let array = isolate_categories_array(&cleaned)
        .ok_or_else(|| anyhow!("no categories array found"))?;
    serde_json::from_str(array).context("categories array not valid JSON")
}

/// Rebuild the document line by line, applying the per-field quote fix to
/// each line independently.
fn pass_line_by_line(span: &str) -> Result<Vec<Category>> {
    let rebuilt: Vec<String> = strip_control(span)
        .lines()
        .map(escape_field_quotes)
        .collect();
    parse_doc(&strip_trailing_commas(&rebuilt.join("\n")))
}

fn strip_control(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

fn strip_trailing_commas(text: &str) -> String {
    let re = Regex::new(r",\s*([}\]])").unwrap();
    re.replace_all(text, "$1").into_owned()
}

/// Escape bare `"` characters inside the values of known string fields.
///
/// A quote closes the value only when the next non-blank character is a
/// comma, brace, bracket, or line end; anything else is treated as an
/// unescaped quote the model forgot to escape.
fn escape_field_quotes(text: &str) -> String {
    let opener = Regex::new(&format!(r#""(?:{STRING_FIELDS})"\s*:\s*""#)).unwrap();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in opener.find_iter(text) {
        if m.start() < cursor {
            continue;
        }
        out.push_str(&text[cursor..m.end()]);
        let rest = &text[m.end()..];
        let (escaped, closed_at) = repair_string_value(rest);
        out.push_str(&escaped);
        cursor = m.end() + closed_at;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Walk a string value, escaping inner quotes, until the closing quote.
/// Returns the repaired value and the byte offset just past the closer
/// (or the full length when no closer was found).
fn repair_string_value(rest: &str) -> (String, usize) {
    let mut out = String::with_capacity(rest.len());
    let mut chars = rest.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some((_, next)) = chars.next() {
                    out.push(next);
                }
            }
            '"' => {
                let tail = rest[pos + c.len_utf8()..].trim_start_matches([' ', '\t']);
                if tail.is_empty() || tail.starts_with([',', '}', ']', '\n', '\r']) {
                    out.push('"');
                    return (out, pos + 1);
                }
                out.push_str("\\\"");
            }
            _ => out.push(c),
        }
    }
    (out, rest.len())
}

/// Locate the `"categories"` key and return its `[...]` value, respecting
/// string literals while matching brackets.
fn isolate_categories_array(text: &str) -> Option<&str> {
    let key = text.find("\"categories\"")?;
    let open = text[key..].find('[')? + key;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=open + i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_embedded_in_prose() {
        let raw = r#"Here is the result: {"categories":[{"name":"A","icon":"🤖","news":[{"title":"T","summary":"S","source":"X","url":"http://u"}]}]} Thanks!"#;
        let cats = parse_categories(raw).unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].name, "A");
        assert_eq!(cats[0].icon, "🤖");
        assert_eq!(cats[0].news.len(), 1);
        assert_eq!(cats[0].news[0].title, "T");
    }

    #[test]
    fn repairs_unescaped_quote_in_summary() {
        let raw = r#"{
  "categories": [
    {
      "name": "A",
      "icon": "🧠",
      "news": [
        {
          "title": "T",
          "summary": "The CEO said "we will ship" next week",
          "source": "X",
          "url": "http://u"
        }
      ]
    }
  ]
}"#;
        let cats = parse_categories(raw).unwrap();
        assert_eq!(
            cats[0].news[0].summary,
            r#"The CEO said "we will ship" next week"#
        );
    }

    #[test]
    fn repairs_trailing_commas() {
        let raw = r#"{"categories":[{"name":"A","icon":"x","news":[{"title":"T","summary":"S",},],},]}"#;
        let cats = parse_categories(raw).unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].news.len(), 1);
    }

    #[test]
    fn isolates_categories_when_envelope_is_broken() {
        // The date value is unquoted garbage, but the array itself is fine.
        let raw = r#"{"date": 2025-06-01 oops, "categories": [{"name":"B","icon":"i","news":[]}]}"#;
        let cats = parse_categories(raw).unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].name, "B");
    }

    #[test]
    fn strips_control_characters() {
        let raw = "{\"categories\":[{\"name\":\"A\",\"icon\":\"i\",\"news\":[{\"title\":\"bad\u{0002}ctl\",\"summary\":\"S\"}]}]}";
        let cats = parse_categories(raw).unwrap();
        assert_eq!(cats[0].news[0].title, "badctl");
    }

    #[test]
    fn hopeless_input_is_an_error() {
        assert!(parse_categories("no json here at all").is_err());
        assert!(parse_categories("{ not even close").is_err());
    }

    #[test]
    fn quote_scan_keeps_legitimate_escapes() {
        let (out, _) = repair_string_value(r#"already \"escaped\" fine", "#);
        assert_eq!(out, r#"already \"escaped\" fine""#);
    }

    #[test]
    fn bracket_matcher_ignores_brackets_inside_strings() {
        let text = r#"{"categories": [{"name":"a ] b","icon":"","news":[]}]}"#;
        let arr = isolate_categories_array(text).unwrap();
        assert!(arr.starts_with('['));
        assert!(arr.ends_with(']'));
        let parsed: Vec<Category> = serde_json::from_str(arr).unwrap();
        assert_eq!(parsed[0].name, "a ] b");
    }
}
