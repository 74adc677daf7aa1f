//! Inline script metadata: parsing and surgical rewriting.
//!
//! A script carries exactly one fenced block:
//!
//! ```text
//! # /// script
//! # requires-python = ">=3.11"
//! # dependencies = [
//! #   "xarray[io]>=2024.1",
//! #   "numpy",
//! # ]
//! # ///
//! ```
//!
//! Every interior line starts with `#`. Stripping that prefix (plus one
//! space) yields a TOML document. Rewrites only ever regenerate the lines of
//! the `dependencies` array; every other byte of the script is kept as is.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BisectError, Result};
use crate::specifier::{normalize_name, DependencySpec};

/// Line opening the metadata block.
pub const START_MARKER: &str = "# /// script";
/// Line closing the metadata block.
pub const END_MARKER: &str = "# ///";

const COMMENT_PREFIX: char = '#';
const DEFAULT_ITEM_INDENT: &str = "  ";

// ---------------------------------------------------------------------------
// Dependency block
// ---------------------------------------------------------------------------

/// Ordered dependency list with unique package names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyBlock {
    entries: Vec<DependencySpec>,
}

impl DependencyBlock {
    /// Build a block, rejecting duplicate package names.
    pub fn from_specifiers<I, S>(specifiers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries: Vec<DependencySpec> = Vec::new();
        for raw in specifiers {
            let spec = DependencySpec::parse(raw.as_ref())?;
            if entries.iter().any(|e| e.key() == spec.key()) {
                return Err(BisectError::Parse(format!(
                    "package '{}' is listed more than once in dependencies",
                    spec.name()
                )));
            }
            entries.push(spec);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[DependencySpec] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bare package names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    /// Specifier strings in declaration order.
    pub fn specifiers(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.as_str().to_string()).collect()
    }

    pub fn get(&self, package: &str) -> Option<&DependencySpec> {
        let key = normalize_name(package);
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn contains(&self, package: &str) -> bool {
        self.get(package).is_some()
    }

    /// Replace the entry for `package` with a source pin at `reference`.
    pub fn pin(&self, package: &str, source: &str, reference: &str) -> Result<Self> {
        let key = normalize_name(package);
        let idx = self
            .entries
            .iter()
            .position(|e| e.key() == key)
            .ok_or_else(|| {
                BisectError::Parse(format!("package '{package}' not found in dependencies"))
            })?;
        let mut entries = self.entries.clone();
        entries[idx] = entries[idx].pinned(source, reference);
        Ok(Self { entries })
    }

    /// Append entries whose package is not yet present.
    ///
    /// Returns the new block and the names actually added. Existing entries
    /// are never touched.
    pub fn append(&self, additions: &[DependencySpec]) -> (Self, Vec<String>) {
        let mut entries = self.entries.clone();
        let mut added = Vec::new();
        for spec in additions {
            if entries.iter().any(|e| e.key() == spec.key()) {
                continue;
            }
            added.push(spec.name().to_string());
            entries.push(spec.clone());
        }
        (Self { entries }, added)
    }

    /// SHA-256 hex digest of the specifier list, used to tell dependency
    /// sets apart in reports.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for spec in &self.entries {
            hasher.update(spec.as_str().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Parsed metadata
// ---------------------------------------------------------------------------

/// Decoded metadata block.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMetadata {
    pub dependencies: DependencyBlock,
    pub requires_python: Option<String>,
    /// The full decoded TOML table.
    pub raw: toml::Table,
}

impl ScriptMetadata {
    pub fn parse(text: &str) -> Result<Self> {
        let layout = BlockLayout::locate(text)?;
        let table: toml::Table = toml::from_str(&layout.decoded())
            .map_err(|e| BisectError::Parse(format!("invalid TOML in metadata block: {e}")))?;

        let dependencies = match table.get("dependencies") {
            None => DependencyBlock::default(),
            Some(toml::Value::Array(items)) => {
                let specs = items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(s) => Ok(s.as_str()),
                        other => Err(BisectError::Parse(format!(
                            "dependencies entries must be strings, found {}",
                            other.type_str()
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                DependencyBlock::from_specifiers(specs)?
            }
            Some(other) => {
                return Err(BisectError::Parse(format!(
                    "'dependencies' must be a list, found {}",
                    other.type_str()
                )))
            }
        };

        let requires_python = match table.get("requires-python") {
            None => None,
            Some(toml::Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(BisectError::Parse(format!(
                    "'requires-python' must be a string, found {}",
                    other.type_str()
                )))
            }
        };

        Ok(Self {
            dependencies,
            requires_python,
            raw: table,
        })
    }

    pub fn has_package(&self, package: &str) -> bool {
        self.dependencies.contains(package)
    }

    pub fn list_packages(&self) -> Vec<String> {
        self.dependencies.names()
    }

    pub fn dependency_spec(&self, package: &str) -> Option<&DependencySpec> {
        self.dependencies.get(package)
    }

    /// Source location of an already source-pinned package.
    pub fn repository_url(&self, package: &str) -> Option<String> {
        self.dependency_spec(package)
            .and_then(|spec| spec.source_pin())
            .map(|pin| pin.source.clone())
    }

    /// Non-fatal observations about the block.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.raw.contains_key("dependencies") {
            warnings.push("no 'dependencies' field found in metadata".to_string());
        }
        if self.requires_python.is_none() {
            warnings.push("no 'requires-python' field found in metadata".to_string());
        }
        warnings
    }
}

// ---------------------------------------------------------------------------
// Rewrites
// ---------------------------------------------------------------------------

/// Pin `package` to `source` at `reference`, returning the new script text.
pub fn update(text: &str, package: &str, source: &str, reference: &str) -> Result<String> {
    let metadata = ScriptMetadata::parse(text)?;
    let block = metadata.dependencies.pin(package, source, reference)?;
    render(text, &block)
}

/// Add dependencies that are not yet declared. Text is returned unchanged
/// when every package is already present.
pub fn append_dependencies<S: AsRef<str>>(text: &str, specifiers: &[S]) -> Result<String> {
    let metadata = ScriptMetadata::parse(text)?;
    let additions = specifiers
        .iter()
        .map(|s| DependencySpec::parse(s.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let (block, added) = metadata.dependencies.append(&additions);
    if added.is_empty() {
        return Ok(text.to_string());
    }
    render(text, &block)
}

/// Replace the dependency lines of `text` with `block`.
pub fn render(text: &str, block: &DependencyBlock) -> Result<String> {
    let layout = BlockLayout::locate(text)?;
    let eol = layout.eol();

    let mut out = String::with_capacity(text.len() + 64);
    match layout.dependency_span()? {
        Some(span) => {
            for line in &layout.lines[..span.first] {
                out.push_str(line);
            }
            let rendered = if span.first == span.last {
                vec![render_inline(&span, block)]
            } else {
                render_multiline(&span, block)
            };
            // The span always precedes the end marker, so its last line is
            // terminated; keep that terminator.
            let last_eol = eol_of(layout.lines[span.last]).unwrap_or(eol);
            let count = rendered.len();
            for (i, line) in rendered.iter().enumerate() {
                out.push_str(line);
                out.push_str(if i + 1 == count { last_eol } else { eol });
            }
            for line in &layout.lines[span.last + 1..] {
                out.push_str(line);
            }
        }
        None => {
            let at = layout.top_level_end();
            for line in &layout.lines[..at] {
                out.push_str(line);
            }
            for line in render_multiline(&DependencySpan::inserted(), block) {
                out.push_str(&line);
                out.push_str(eol);
            }
            for line in &layout.lines[at..] {
                out.push_str(line);
            }
        }
    }
    Ok(out)
}

fn render_inline(span: &DependencySpan, block: &DependencyBlock) -> String {
    let items = block
        .entries()
        .iter()
        .map(|e| quote(e.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{COMMENT_PREFIX} {}dependencies = [{items}]{}",
        span.key_indent, span.trailer
    )
}

/// One entry per line, trailing commas, no line terminators.
fn render_multiline(span: &DependencySpan, block: &DependencyBlock) -> Vec<String> {
    let mut lines = Vec::with_capacity(block.len() + 2);
    lines.push(format!("{COMMENT_PREFIX} {}dependencies = [", span.key_indent));
    for entry in block.entries() {
        lines.push(format!(
            "{COMMENT_PREFIX} {}{},",
            span.item_indent,
            quote(entry.as_str())
        ));
    }
    lines.push(format!("{COMMENT_PREFIX} {}]{}", span.key_indent, span.trailer));
    lines
}

/// Basic TOML string literal.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// ---------------------------------------------------------------------------
// Block layout
// ---------------------------------------------------------------------------

/// Line-level view of the fenced block. `lines` keep their terminators.
struct BlockLayout<'a> {
    lines: Vec<&'a str>,
    start: usize,
    end: usize,
}

struct DependencySpan {
    first: usize,
    last: usize,
    key_indent: String,
    item_indent: String,
    trailer: String,
}

impl DependencySpan {
    fn inserted() -> Self {
        Self {
            first: 0,
            last: 0,
            key_indent: String::new(),
            item_indent: DEFAULT_ITEM_INDENT.to_string(),
            trailer: String::new(),
        }
    }
}

impl<'a> BlockLayout<'a> {
    fn locate(text: &'a str) -> Result<Self> {
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let start = lines
            .iter()
            .position(|l| strip_eol(l).trim_end() == START_MARKER)
            .ok_or_else(|| BisectError::Parse("no script metadata block found".to_string()))?;
        let end = lines[start + 1..]
            .iter()
            .position(|l| strip_eol(l).trim_end() == END_MARKER)
            .map(|i| start + 1 + i)
            .ok_or_else(|| {
                BisectError::Parse(format!(
                    "metadata block opened on line {} is never closed with '{END_MARKER}'",
                    start + 1
                ))
            })?;

        for (offset, line) in lines[start + 1..end].iter().enumerate() {
            if !strip_eol(line).starts_with(COMMENT_PREFIX) {
                return Err(BisectError::Parse(format!(
                    "metadata line {} must start with '{COMMENT_PREFIX}': {}",
                    start + 2 + offset,
                    strip_eol(line)
                )));
            }
        }

        Ok(Self { lines, start, end })
    }

    fn interior(&self) -> impl Iterator<Item = (usize, &'a str)> + '_ {
        (self.start + 1..self.end).map(move |i| (i, uncomment(strip_eol(self.lines[i]))))
    }

    fn decoded(&self) -> String {
        self.interior()
            .map(|(_, content)| content)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn eol(&self) -> &'static str {
        eol_of(self.lines[self.start]).unwrap_or("\n")
    }

    /// Index just past the last non-blank top-level line: new top-level keys
    /// go here, ahead of any table header.
    fn top_level_end(&self) -> usize {
        let mut at = self
            .interior()
            .find(|(_, content)| content.trim_start().starts_with('['))
            .map_or(self.end, |(idx, _)| idx);
        while at > self.start + 1
            && uncomment(strip_eol(self.lines[at - 1])).trim().is_empty()
        {
            at -= 1;
        }
        at
    }

    /// Lines spanned by the top-level `dependencies = [...]` array.
    fn dependency_span(&self) -> Result<Option<DependencySpan>> {
        let mut found = None;
        for (idx, content) in self.interior() {
            let trimmed = content.trim_start();
            if trimmed.starts_with('[') {
                // A table header ends the top-level section.
                break;
            }
            if let Some(after_key) = trimmed.strip_prefix("dependencies") {
                let after_key = after_key.trim_start();
                if let Some(value) = after_key.strip_prefix('=') {
                    let key_indent = content[..content.len() - trimmed.len()].to_string();
                    let value_offset = content.len() - value.len();
                    found = Some((idx, key_indent, value_offset));
                    break;
                }
            }
        }
        let Some((first, key_indent, value_offset)) = found else {
            return Ok(None);
        };

        let mut scanner = ArrayScanner::default();
        let mut item_indent = None;
        for idx in first..self.end {
            let content = uncomment(strip_eol(self.lines[idx]));
            let from = if idx == first { value_offset } else { 0 };
            if idx > first && item_indent.is_none() {
                let trimmed = content.trim_start();
                if trimmed.starts_with('"') || trimmed.starts_with('\'') {
                    item_indent = Some(content[..content.len() - trimmed.len()].to_string());
                }
            }
            if let Some(close) = scanner.feed(&content[from..]) {
                let trailer = content[from + close + 1..].to_string();
                return Ok(Some(DependencySpan {
                    first,
                    last: idx,
                    key_indent,
                    item_indent: item_indent.unwrap_or_else(|| DEFAULT_ITEM_INDENT.to_string()),
                    trailer,
                }));
            }
        }
        Err(BisectError::Parse(
            "could not find the end of the 'dependencies' array".to_string(),
        ))
    }
}

/// Tracks bracket depth across lines, ignoring brackets inside strings and
/// comments.
#[derive(Default)]
struct ArrayScanner {
    depth: usize,
    opened: bool,
}

impl ArrayScanner {
    /// Byte offset of the bracket closing the array, if it is on this line.
    fn feed(&mut self, line: &str) -> Option<usize> {
        let mut quote: Option<char> = None;
        let mut escaped = false;
        for (i, c) in line.char_indices() {
            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' && q == '"' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => quote = Some(c),
                '#' => break,
                '[' => {
                    self.depth += 1;
                    self.opened = true;
                }
                ']' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.opened && self.depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

fn strip_eol(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .unwrap_or(line)
}

fn eol_of(line: &str) -> Option<&'static str> {
    if line.ends_with("\r\n") {
        Some("\r\n")
    } else if line.ends_with('\n') {
        Some("\n")
    } else {
        None
    }
}

/// Drop the comment prefix and at most one following space.
fn uncomment(line: &str) -> &str {
    let rest = line.strip_prefix(COMMENT_PREFIX).unwrap_or(line);
    rest.strip_prefix(' ').unwrap_or(rest)
}
