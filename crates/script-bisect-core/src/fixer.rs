//! Missing-dependency detection for failed probes.
//!
//! A catalog of [`FixDirective`]s maps error-text signatures to packages
//! that are absent from the script's declared environment. Detection is a
//! pure function of the error text; applying fixes is purely additive.

use std::collections::BTreeMap;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{BisectError, Result};
use crate::metadata::DependencyBlock;
use crate::specifier::{normalize_name, DependencySpec};

/// Built-in signatures: (package, trigger, reason).
const BUILTIN_FIXES: &[(&str, &str, &str)] = &[
    (
        "cftime",
        r"The cftime package is required for working with non-standard calendars",
        "Required for non-standard calendar decoding in xarray/netCDF",
    ),
    (
        "dask[array]",
        r"chunk manager 'dask' is not available",
        "Required for chunked array operations",
    ),
    (
        "dask[array]",
        r"make sure 'dask' is installed",
        "Required for chunked array operations",
    ),
    (
        "netcdf4",
        r"No module named 'netCDF4'",
        "Required for NetCDF4 backend",
    ),
    (
        "scipy",
        r"No module named 'scipy'",
        "Required for scipy backend in xarray",
    ),
    (
        "matplotlib",
        r"No module named 'matplotlib'",
        "Required for plotting functionality",
    ),
    (
        "seaborn",
        r"No module named 'seaborn'",
        "Required for statistical plotting",
    ),
    (
        "zarr",
        r"No module named 'zarr'",
        "Required for Zarr array storage",
    ),
    (
        "fsspec",
        r"No module named 'fsspec'",
        "Required for file system operations",
    ),
    ("h5py", r"No module named 'h5py'", "Required for HDF5 operations"),
    (
        "bottleneck",
        r"No module named 'bottleneck'",
        "Required for optimized array operations",
    ),
    (
        "numbagg",
        r"No module named 'numbagg'",
        "Required for numba-accelerated operations",
    ),
];

/// One catalog entry.
#[derive(Debug, Clone)]
pub struct FixDirective {
    /// Specifier to append, e.g. `dask[array]`.
    pub package: String,
    pub trigger: Regex,
    pub reason: String,
}

impl FixDirective {
    /// Compile a directive; the trigger is matched case-insensitively.
    pub fn new(package: &str, pattern: &str, reason: &str) -> Result<Self> {
        DependencySpec::parse(package)?;
        let trigger = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                BisectError::InvalidConfig(format!("invalid fix pattern for '{package}': {e}"))
            })?;
        Ok(Self {
            package: package.to_string(),
            trigger,
            reason: reason.to_string(),
        })
    }

    fn key(&self) -> String {
        normalize_name(&crate::specifier::package_name(&self.package))
    }
}

impl PartialEq for FixDirective {
    fn eq(&self, other: &Self) -> bool {
        self.package == other.package
            && self.trigger.as_str() == other.trigger.as_str()
            && self.reason == other.reason
    }
}

impl Eq for FixDirective {}

/// Rules file entry (`[[fix]]` tables).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRule {
    pub package: String,
    pub pattern: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct FixRulesFile {
    #[serde(default)]
    fix: Vec<FixRule>,
}

/// Result of applying fixes to a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    /// At least one package was added.
    Applied {
        block: DependencyBlock,
        added: Vec<String>,
    },
    /// Every suggested package was already declared.
    NoProgress,
}

/// The set of known missing-dependency signatures.
#[derive(Debug, Clone)]
pub struct FixCatalog {
    directives: Vec<FixDirective>,
}

impl FixCatalog {
    /// Catalog with the built-in signatures.
    pub fn builtin() -> Result<Self> {
        let directives = BUILTIN_FIXES
            .iter()
            .map(|(package, pattern, reason)| FixDirective::new(package, pattern, reason))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { directives })
    }

    /// Catalog with exactly the given directives.
    pub fn from_directives(directives: Vec<FixDirective>) -> Self {
        Self { directives }
    }

    pub fn empty() -> Self {
        Self {
            directives: Vec::new(),
        }
    }

    pub fn directives(&self) -> &[FixDirective] {
        &self.directives
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Add the rules of a TOML rules file.
    ///
    /// ```toml
    /// [[fix]]
    /// package = "pooch"
    /// pattern = "No module named 'pooch'"
    /// reason = "tutorial datasets"
    /// ```
    pub fn extend_from_toml(&mut self, source: &str) -> Result<usize> {
        let file: FixRulesFile = toml::from_str(source)
            .map_err(|e| BisectError::InvalidConfig(format!("invalid fix rules: {e}")))?;
        let count = file.fix.len();
        for rule in file.fix {
            self.directives
                .push(FixDirective::new(&rule.package, &rule.pattern, &rule.reason)?);
        }
        Ok(count)
    }

    pub fn extend_from_file(&mut self, path: &Path) -> Result<usize> {
        let source = std::fs::read_to_string(path)?;
        self.extend_from_toml(&source)
    }

    /// All directives whose trigger occurs in `error_text`.
    ///
    /// One directive per package, ordered by package name, so the result
    /// does not depend on catalog order.
    pub fn detect(&self, error_text: &str) -> Vec<FixDirective> {
        let mut by_package: BTreeMap<String, &FixDirective> = BTreeMap::new();
        for directive in &self.directives {
            if directive.trigger.is_match(error_text) {
                let key = directive.key();
                match by_package.get(&key) {
                    // Keep the lexically smallest package spelling so that the
                    // choice never depends on iteration order.
                    Some(existing) if existing.package <= directive.package => {}
                    _ => {
                        by_package.insert(key, directive);
                    }
                }
            }
        }
        by_package.into_values().cloned().collect()
    }
}

/// Append the packages named by `fixes` to `block`.
pub fn apply(block: &DependencyBlock, fixes: &[FixDirective]) -> Result<FixOutcome> {
    let additions = fixes
        .iter()
        .map(|f| DependencySpec::parse(&f.package))
        .collect::<Result<Vec<_>>>()?;
    let (block, added) = block.append(&additions);
    if added.is_empty() {
        Ok(FixOutcome::NoProgress)
    } else {
        Ok(FixOutcome::Applied { block, added })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packages(fixes: &[FixDirective]) -> Vec<&str> {
        fixes.iter().map(|f| f.package.as_str()).collect()
    }

    #[test]
    fn test_builtin_catalog_compiles() {
        let catalog = FixCatalog::builtin().unwrap();
        assert_eq!(catalog.len(), BUILTIN_FIXES.len());
    }

    #[test]
    fn test_detect_single_missing_module() {
        let catalog = FixCatalog::builtin().unwrap();
        let text = "Traceback...\nModuleNotFoundError: No module named 'scipy'\n";
        assert_eq!(packages(&catalog.detect(text)), vec!["scipy"]);
    }

    #[test]
    fn test_detect_is_case_insensitive() {
        let catalog = FixCatalog::builtin().unwrap();
        let text = "no module named 'NETCDF4'";
        assert_eq!(packages(&catalog.detect(text)), vec!["netcdf4"]);
    }

    #[test]
    fn test_detect_multiple_and_dedups_by_package() {
        let catalog = FixCatalog::builtin().unwrap();
        let text = "chunk manager 'dask' is not available; make sure 'dask' is installed.\n\
                    No module named 'zarr'";
        assert_eq!(packages(&catalog.detect(text)), vec!["dask[array]", "zarr"]);
    }

    #[test]
    fn test_detect_nothing_for_unrelated_error() {
        let catalog = FixCatalog::builtin().unwrap();
        assert!(catalog.detect("AssertionError: values differ").is_empty());
    }

    #[test]
    fn test_detect_order_independent() {
        let catalog = FixCatalog::builtin().unwrap();
        let mut reversed: Vec<FixDirective> = catalog.directives().to_vec();
        reversed.reverse();
        let reversed = FixCatalog::from_directives(reversed);
        let text = "No module named 'h5py'\nNo module named 'fsspec'\nmake sure 'dask' is installed";
        assert_eq!(catalog.detect(text), reversed.detect(text));
        assert_eq!(catalog.detect(text), catalog.detect(text));
    }

    #[test]
    fn test_apply_adds_only_missing() {
        let catalog = FixCatalog::builtin().unwrap();
        let block = DependencyBlock::from_specifiers(["xarray", "scipy"]).unwrap();
        let fixes = catalog.detect("No module named 'scipy'\nNo module named 'zarr'");
        match apply(&block, &fixes).unwrap() {
            FixOutcome::Applied { block, added } => {
                assert_eq!(added, vec!["zarr"]);
                assert_eq!(block.specifiers(), vec!["xarray", "scipy", "zarr"]);
            }
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn test_apply_reports_no_progress() {
        let catalog = FixCatalog::builtin().unwrap();
        let block = DependencyBlock::from_specifiers(["dask[dataframe]"]).unwrap();
        let fixes = catalog.detect("make sure 'dask' is installed");
        assert_eq!(apply(&block, &fixes).unwrap(), FixOutcome::NoProgress);
    }

    #[test]
    fn test_rules_file_extends_catalog() {
        let mut catalog = FixCatalog::empty();
        let added = catalog
            .extend_from_toml(
                r#"
[[fix]]
package = "pooch"
pattern = "No module named 'pooch'"
reason = "tutorial datasets"
"#,
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            packages(&catalog.detect("No module named 'pooch'")),
            vec!["pooch"]
        );
    }

    #[test]
    fn test_rules_file_rejects_bad_pattern() {
        let mut catalog = FixCatalog::empty();
        let err = catalog
            .extend_from_toml("[[fix]]\npackage = \"x\"\npattern = \"(unclosed\"\n")
            .unwrap_err();
        assert!(matches!(err, BisectError::InvalidConfig(_)));
    }
}
