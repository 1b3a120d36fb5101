use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{Error, ErrorKind, Result};

const PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)";

/// Expands variables in every string value (object keys are left alone).
///
/// `source` is only used to point at the first use of an undefined variable.
pub fn expand_value<F>(value: &mut Value, source: &str, lookup: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let re = Regex::new(PATTERN).map_err(|e| Error::msg(format!("invalid env pattern: {e}")))?;
    walk(value, &re, source, lookup)
}

fn walk<F>(value: &mut Value, re: &Regex, source: &str, lookup: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = expand_str(s, re, source, lookup)?;
            }
        }
        Value::Array(items) => {
            for v in items {
                walk(v, re, source, lookup)?;
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                walk(v, re, source, lookup)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

fn expand_str<F>(s: &str, re: &Regex, source: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Option<String> = None;
    let out = re.replace_all(s, |caps: &Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match lookup(name) {
            Some(v) => v,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(undefined(&name, source));
    }
    Ok(out.into_owned())
}

fn undefined(name: &str, source: &str) -> Error {
    let location = [format!("${{{name}}}"), format!("${name}")]
        .iter()
        .filter_map(|needle| find_token(source, needle))
        .min()
        .map(|offset| {
            let (line, ch) = line_and_char(source, offset);
            format!(" (line {line}, character {ch})")
        })
        .unwrap_or_default();
    Error::new(
        ErrorKind::EnvVarUndefined,
        format!("'{name}' is not set{location}"),
    )
}

/// Offset of `needle` where it is not just a prefix of a longer name.
fn find_token(source: &str, needle: &str) -> Option<usize> {
    source.match_indices(needle).map(|(i, _)| i).find(|&i| {
        needle.ends_with('}')
            || !source[i + needle.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// 1-based line and character for a byte offset. Lines end at `\n`.
pub fn line_and_char(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let ch = before[line_start..].chars().count() + 1;
    (line, ch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(name: &str) -> Option<String> {
        match name {
            "COREBOOT_VERSION" => Some("24.02".into()),
            "ROOT" => Some("/src".into()),
            _ => None,
        }
    }

    #[test]
    fn expands_nested_strings() {
        let mut v = json!({
            "coreboot": {
                "coreboot-example": {
                    "sdk_source": "ghcr.io/example/coreboot_${COREBOOT_VERSION}:main",
                    "input_dirs": ["$ROOT/blobs", "plain"],
                    "ignore": true
                }
            }
        });
        expand_value(&mut v, "", &env).expect("expand");
        let m = &v["coreboot"]["coreboot-example"];
        assert_eq!(m["sdk_source"], "ghcr.io/example/coreboot_24.02:main");
        assert_eq!(m["input_dirs"][0], "/src/blobs");
        assert_eq!(m["input_dirs"][1], "plain");
    }

    #[test]
    fn undefined_variable_is_located() {
        let source = "{\n  \"linux\": {\n    \"l\": {\"arch\": \"$ROOTX\"}\n  }\n}\n";
        let mut v: Value = serde_json::from_str(source).unwrap();
        let err = expand_value(&mut v, source, &env).unwrap_err();
        assert!(err.is(ErrorKind::EnvVarUndefined));
        assert!(err.to_string().contains("'ROOTX'"), "{err}");
        assert!(err.to_string().contains("line 3, character 20"), "{err}");
    }

    #[test]
    fn line_and_char_counts_from_one() {
        let s = "ab\ncd\n\nxyz";
        assert_eq!(line_and_char(s, 0), (1, 1));
        assert_eq!(line_and_char(s, 1), (1, 2));
        assert_eq!(line_and_char(s, 3), (2, 1));
        assert_eq!(line_and_char(s, 6), (3, 1));
        assert_eq!(line_and_char(s, 9), (4, 3));
    }
}
