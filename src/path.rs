//! Path and name utilities.
//!
//! All operations in this crate use a normalized absolute path with `/`
//! separators and NFC-normalized Unicode. These functions are pure and
//! have no knowledge of any particular tree.

use globset::{Glob, GlobSet, GlobSetBuilder};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use unicode_normalization::UnicodeNormalization;

use crate::error::TreeError;

/// Characters percent-encoded in a remote-URL path segment, beyond the
/// ASCII control range: anything that would otherwise need escaping in a
/// URL path component.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'|')
    .add(b'\\');

/// Default temp-name patterns, used when a tree is not configured with its
/// own set. Matches common editor swap/backup files and dotfiles.
pub const DEFAULT_TEMP_PATTERNS: &[&str] = &[".*", "~*", "*~", "*.tmp", "*.swp", "*.swx"];

/// Normalize a path: apply NFC, ensure a leading `/`, collapse a trailing
/// `/` (except for the root), and reject `..` segments.
pub fn normalize(raw: &str) -> Result<String, TreeError> {
    let nfc: String = raw.nfc().collect();
    let mut out = if nfc.starts_with('/') { nfc } else { format!("/{nfc}") };

    for segment in out.split('/') {
        if segment == ".." {
            return Err(TreeError::InvalidPath(raw.to_string()));
        }
    }

    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Split off the parent directory of a normalized path. The parent of `/`
/// is `/`.
pub fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

/// The final path segment (the file or directory name).
pub fn leaf(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a parent path and a child name into a normalized child path.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Path of the creation marker for `path`, a sibling of the sync marker
/// under the same directory in the work tree: `<path>.rqcf`.
pub fn create_marker_name(path: &str) -> String {
    format!("{path}.rqcf")
}

/// Whether `path` is `prefix` itself or lives under it, respecting path
/// segment boundaries. A plain `starts_with` would also match an unrelated
/// sibling whose name happens to extend the prefix as a string (`/a` vs.
/// `/ab/f.txt`), which prefix-scoped operations like a directory rename or
/// delete must not touch.
pub fn under_prefix(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
}

/// Percent-encode each path segment for use against the remote endpoint,
/// preserving `/` as the segment separator.
pub fn remote_encode(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compiled set of temp-name glob patterns, inherited by the remote tree
/// and consulted by `is_temp`.
#[derive(Clone)]
pub struct TempPatterns {
    set: GlobSet,
}

impl TempPatterns {
    /// Compile a pattern list. Patterns are matched against the leaf name
    /// only, not the full path.
    pub fn compile<I, S>(patterns: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern.as_ref())
                .map_err(|e| TreeError::InvalidPath(format!("bad temp pattern: {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| TreeError::InvalidPath(format!("bad temp pattern set: {e}")))?;
        Ok(Self { set })
    }

    /// The built-in defaults (dotfiles, `~`-prefixed/suffixed, editor swap
    /// files).
    pub fn default_patterns() -> Self {
        Self::compile(DEFAULT_TEMP_PATTERNS.iter()).expect("default patterns are valid globs")
    }

    /// Whether `path`'s leaf name matches any configured temp pattern.
    pub fn is_temp(&self, path: &str) -> bool {
        self.set.is_match(leaf(path))
    }
}

impl Default for TempPatterns {
    fn default() -> Self {
        Self::default_patterns()
    }
}

/// Whether any segment of `path` begins with `.` — the "forbidden name"
/// rule the sync processor applies before ever attempting to transmit a
/// request.
pub fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.') && !segment.is_empty())
}
