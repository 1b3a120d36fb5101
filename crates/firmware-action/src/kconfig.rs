use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    NotSet,
    Value(String),
}

/// A `.config` / defconfig as a sorted map of symbols.
///
/// Only `KEY=VALUE` and `# KEY is not set` lines are kept; other comments and
/// blank lines are dropped on parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Kconfig {
    entries: BTreeMap<String, Entry>,
}

impl Kconfig {
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                if let Some(key) = rest.trim().strip_suffix(" is not set") {
                    let key = key.trim();
                    if !key.is_empty() && !key.contains(char::is_whitespace) {
                        entries.insert(key.to_string(), Entry::NotSet);
                    }
                }
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                let k = k.trim();
                if k.is_empty() {
                    continue;
                }
                entries.insert(k.to_string(), Entry::Value(v.to_string()));
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(Entry::Value(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// String value with the surrounding Kconfig quotes removed.
    pub fn get_unquoted(&self, key: &str) -> Option<String> {
        self.get(key).map(unquote)
    }

    pub fn key_is_not_set(&self, key: &str) -> bool {
        matches!(self.entries.get(key), Some(Entry::NotSet))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: &str, raw_value: &str) {
        self.entries
            .insert(key.to_string(), Entry::Value(raw_value.to_string()));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, &quote(value));
    }

    pub fn unset(&mut self, key: &str) {
        self.entries.insert(key.to_string(), Entry::NotSet);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Kconfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            match v {
                Entry::NotSet => writeln!(f, "# {k} is not set")?,
                Entry::Value(v) => writeln!(f, "{k}={v}")?,
            }
        }
        Ok(())
    }
}

pub fn quote(v: &str) -> String {
    let esc = v.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{esc}\"")
}

pub fn unquote(v: &str) -> String {
    let v = v.trim();
    match v.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => v.to_string(),
    }
}
