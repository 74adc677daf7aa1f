//! Dependency specifier grammar.
//!
//! Two forms are understood:
//! - registry: `name[extras]<op><version> ; marker`
//! - source-pinned: `name[extras]@source@ref ; marker`
//!
//! Only the pieces needed for rewriting are extracted; version constraints
//! are carried verbatim inside the raw string.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BisectError, Result};

/// A source location plus the optional ref it is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePin {
    pub source: String,
    pub reference: Option<String>,
}

/// One parsed dependency entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    raw: String,
    name: String,
    extras: Option<String>,
    pin: Option<SourcePin>,
    marker: Option<String>,
}

impl DependencySpec {
    /// Parse a specifier string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let name_len = raw
            .char_indices()
            .find(|(_, c)| !is_name_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(raw.len());
        if name_len == 0 {
            return Err(BisectError::Parse(format!(
                "dependency specifier '{raw}' does not start with a package name"
            )));
        }
        let name = raw[..name_len].to_string();
        let mut rest = raw[name_len..].trim_start();

        let mut extras = None;
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| {
                BisectError::Parse(format!("unterminated extras in specifier '{raw}'"))
            })?;
            let inner = after[..close].trim();
            if !inner.is_empty() {
                extras = Some(inner.to_string());
            }
            rest = after[close + 1..].trim_start();
        }

        let (body, marker) = match rest.find(';') {
            Some(idx) => {
                let marker = rest[idx + 1..].trim();
                (
                    rest[..idx].trim_end(),
                    (!marker.is_empty()).then(|| marker.to_string()),
                )
            }
            None => (rest, None),
        };

        let pin = body
            .strip_prefix('@')
            .map(|location| split_source_ref(location.trim()));

        Ok(Self {
            raw: raw.to_string(),
            name,
            extras,
            pin,
            marker,
        })
    }

    /// The specifier exactly as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Bare package name as written.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Package name used for lookups and deduplication.
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }

    /// Comma-separated extras without brackets.
    pub fn extras(&self) -> Option<&str> {
        self.extras.as_deref()
    }

    pub fn source_pin(&self) -> Option<&SourcePin> {
        self.pin.as_ref()
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    /// A copy of this entry pinned to `source` at `reference`.
    ///
    /// Extras and environment markers survive; any existing pin or version
    /// constraint is replaced as a whole.
    pub fn pinned(&self, source: &str, reference: &str) -> Self {
        let source = normalize_source(source);
        let mut raw = self.name.clone();
        if let Some(extras) = &self.extras {
            raw.push('[');
            raw.push_str(extras);
            raw.push(']');
        }
        raw.push('@');
        raw.push_str(&source);
        raw.push('@');
        raw.push_str(reference);
        if let Some(marker) = &self.marker {
            raw.push_str(" ; ");
            raw.push_str(marker);
        }
        Self {
            raw,
            name: self.name.clone(),
            extras: self.extras.clone(),
            pin: Some(SourcePin {
                source,
                reference: Some(reference.to_string()),
            }),
            marker: self.marker.clone(),
        }
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Bare package name of a specifier string, or the trimmed input when no
/// name can be extracted.
pub fn package_name(spec: &str) -> String {
    DependencySpec::parse(spec)
        .map(|s| s.name)
        .unwrap_or_else(|_| spec.trim().to_string())
}

/// Case-fold and collapse runs of `-`, `_` and `.` so that `Foo_Bar` and
/// `foo-bar` name the same package.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.extend(c.to_lowercase());
            in_separator = false;
        }
    }
    out
}

/// Prefix plain URLs with `git+`; URLs that already name a VCS scheme are
/// left alone.
pub fn normalize_source(source: &str) -> String {
    let source = source.trim();
    let scheme_end = source.find("://").unwrap_or(0);
    if source[..scheme_end].contains('+') || source.starts_with("git+") {
        source.to_string()
    } else {
        format!("git+{source}")
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Split `source@ref`. The last `@` only starts a ref when it follows the
/// path of a `scheme://host/path` URL; an `@` inside the authority
/// (`ssh://git@host/...`) belongs to the source.
fn split_source_ref(location: &str) -> SourcePin {
    if let Some(at) = location.rfind('@') {
        let (source, reference) = (&location[..at], &location[at + 1..]);
        let has_path = source
            .find("://")
            .map(|i| source[i + 3..].contains('/'))
            .unwrap_or(false);
        if has_path && !reference.is_empty() {
            return SourcePin {
                source: source.to_string(),
                reference: Some(reference.to_string()),
            };
        }
    }
    SourcePin {
        source: location.to_string(),
        reference: None,
    }
}
