// Path-or-URL pointers
//
// Metadata references may be windows paths, unix paths (absolute or
// relative) or URLs, optionally followed by a `#/a/b` fragment. They are
// normalised into one value so that relative references can be joined
// against the location of the document that contains them.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::error::{DfdsError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Path(PathBuf),
    Url(Url),
}

/// A file system path or URL with an optional fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathOrUrl {
    location: Location,
    fragment: Option<String>,
}

fn is_windows_path(ptr: &str) -> bool {
    let bytes = ptr.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn split_fragment(ptr: &str) -> (&str, Option<String>) {
    match ptr.split_once('#') {
        Some((head, frag)) => {
            let frag = frag.trim().trim_start_matches('#');
            let frag = if frag.is_empty() { None } else { Some(frag.to_string()) };
            (head, frag)
        }
        None => (ptr, None),
    }
}

/// Lexically resolve `.` and `..` without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl PathOrUrl {
    pub fn parse(ptr: &str) -> Result<Self> {
        let ptr = ptr.trim();
        if ptr.is_empty() {
            return Err(DfdsError::Parse("empty metadata pointer".to_string()));
        }
        let (head, fragment) = split_fragment(ptr);

        // a single-letter scheme is a windows drive
        if is_windows_path(head) || !head.contains("://") {
            let path = if head.is_empty() {
                PathBuf::new()
            } else {
                PathBuf::from(head.trim_end_matches(['/', '\\']))
            };
            return Ok(Self {
                location: Location::Path(path),
                fragment,
            });
        }

        let url = Url::parse(head)
            .map_err(|e| DfdsError::Parse(format!("invalid url '{}': {}", head, e)))?;
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| DfdsError::Parse(format!("invalid file url: {}", head)))?;
            return Ok(Self {
                location: Location::Path(path),
                fragment,
            });
        }
        Ok(Self {
            location: Location::Url(url),
            fragment,
        })
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::Path(path.into()),
            fragment: None,
        }
    }

    pub fn is_url(&self) -> bool {
        matches!(self.location, Location::Url(_))
    }

    pub fn fspath(&self) -> Option<&Path> {
        match &self.location {
            Location::Path(p) => Some(p.as_path()),
            Location::Url(_) => None,
        }
    }

    pub fn url(&self) -> Option<&Url> {
        match &self.location {
            Location::Url(u) => Some(u),
            Location::Path(_) => None,
        }
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub fn without_fragment(&self) -> Self {
        Self {
            location: self.location.clone(),
            fragment: None,
        }
    }

    /// Resolve `other` against this pointer.
    ///
    /// A URL on the right-hand side replaces the base. Otherwise the
    /// relative part is joined to the base's directory (URL join for URL
    /// bases). The result carries `other`'s fragment.
    pub fn join(&self, other: &PathOrUrl) -> Result<PathOrUrl> {
        let location = match (&self.location, &other.location) {
            (_, Location::Url(u)) => Location::Url(u.clone()),
            (Location::Path(base), Location::Path(rel)) => {
                if rel.as_os_str().is_empty() {
                    Location::Path(base.clone())
                } else if rel.is_absolute() || is_windows_path(&rel.to_string_lossy()) {
                    Location::Path(rel.clone())
                } else {
                    let dir = base.parent().unwrap_or_else(|| Path::new(""));
                    Location::Path(normalize(&dir.join(rel)))
                }
            }
            (Location::Url(base), Location::Path(rel)) => {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if rel.is_empty() {
                    Location::Url(base.clone())
                } else {
                    let joined = base.join(&rel).map_err(|e| {
                        DfdsError::Parse(format!("cannot join '{}' onto '{}': {}", rel, base, e))
                    })?;
                    Location::Url(joined)
                }
            }
        };
        Ok(PathOrUrl {
            location,
            fragment: other.fragment.clone(),
        })
    }

    pub fn to_url(&self, drop_fragment: bool) -> String {
        let mut out = match &self.location {
            Location::Path(p) => p.to_string_lossy().into_owned(),
            Location::Url(u) => {
                let mut u = u.clone();
                u.set_fragment(None);
                u.to_string()
            }
        };
        if !drop_fragment {
            if let Some(frag) = &self.fragment {
                out.push('#');
                out.push_str(frag);
            }
        }
        out
    }
}

impl fmt::Display for PathOrUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url(false))
    }
}
