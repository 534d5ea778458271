//! Package lookup in the work directory
//!
//! Only the top level of the work directory is searched. Matches are
//! ordered by version-aware file name comparison (`1.10` after `1.9`), so
//! the last match is the newest version.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::PackageSpec;
use crate::error::ConfigurationError;

use super::{ArtifactError, ArtifactRef};

fn matcher(pattern: &str, field: &str) -> Result<GlobMatcher, ConfigurationError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| ConfigurationError::new(field, e.to_string()))
}

/// Compare file names with digit runs taken as numbers
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let (mut x, mut y) = (a, b);
    loop {
        match (x.is_empty(), y.is_empty()) {
            (true, true) => return a.cmp(b),
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        let (cx, rest_x) = split_chunk(x);
        let (cy, rest_y) = split_chunk(y);
        let digits = |c: &str| c.bytes().all(|b| b.is_ascii_digit());

        let ord = if digits(cx) && digits(cy) {
            let (nx, ny) = (cx.trim_start_matches('0'), cy.trim_start_matches('0'));
            nx.len().cmp(&ny.len()).then_with(|| nx.cmp(ny))
        } else {
            cx.cmp(cy)
        };
        if ord != Ordering::Equal {
            return ord;
        }
        x = rest_x;
        y = rest_y;
    }
}

/// Leading run of digits or of non-digits
fn split_chunk(s: &str) -> (&str, &str) {
    let numeric = s.starts_with(|c: char| c.is_ascii_digit());
    let end = s
        .find(|c: char| c.is_ascii_digit() != numeric)
        .unwrap_or(s.len());
    s.split_at(end)
}

/// Files directly inside `dir` whose name matches `pattern`, oldest version first
pub fn find_matches(dir: &Path, pattern: &str, field: &str) -> Result<Vec<PathBuf>, ArtifactError> {
    let matcher = matcher(pattern, field)?;
    let mut matches = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry.map_err(|e| ArtifactError::Walk {
            dir: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if matcher.is_match(entry.file_name()) {
            matches.push(entry.path().to_path_buf());
        }
    }

    matches.sort_by(|a, b| {
        let name = |p: &PathBuf| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        version_cmp(&name(a), &name(b))
    });
    Ok(matches)
}

/// Resolve one package: local match, else the published default
///
/// `Ok(None)` only for optional packages with neither.
pub fn locate_package(
    dir: &Path,
    name: &str,
    spec: &PackageSpec,
    required: bool,
) -> Result<Option<ArtifactRef>, ArtifactError> {
    let field = format!("artifacts.{}.pattern", name);
    let mut matches = find_matches(dir, &spec.pattern, &field)?;

    if matches.len() > 1 {
        warn!(
            package = name,
            candidates = matches.len(),
            "several local packages match, using the newest version"
        );
    }

    if let Some(path) = matches.pop() {
        return Ok(Some(ArtifactRef::Local(path)));
    }

    match (&spec.default_url, required) {
        (Some(url), _) => Ok(Some(ArtifactRef::Remote(url.clone()))),
        (None, false) => Ok(None),
        (None, true) => Err(ArtifactError::Unavailable {
            artifact: name.to_string(),
            reason: format!(
                "no file matching '{}' in {} and no default location configured",
                spec.pattern,
                dir.display()
            ),
        }),
    }
}
