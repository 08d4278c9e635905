// Upspin cacheserver.
//! Upspin path names: `user@domain/elem1/.../elemN`.
//!
//! A [`PathName`] is always stored in cleaned form: `.` elements are
//! collapsed, repeated slashes are collapsed, and a `..` that would escape
//! the user's root is rejected at parse time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// The `user@domain` component of a path name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserName(String);

impl UserName {
    pub fn new(s: impl Into<String>) -> UserName {
        UserName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A filesystem-safe representation, for use as a cache subdirectory name.
    ///
    /// `@` is not special on any filesystem we target, but we still avoid it
    /// to keep directory names easy to `ls` and `grep` by hand.
    pub fn dir_name(&self) -> String {
        self.0.replace('@', "_at_")
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cleaned Upspin path name: `user@domain/elem1/.../elemN`.
///
/// The empty tail (just `user@domain/` or `user@domain`) denotes the user's
/// root directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathName {
    user: UserName,
    /// Cleaned, slash-separated elements; empty for the root.
    elems: Vec<String>,
}

impl PathName {
    /// Parse and clean a path name.
    ///
    /// Returns [`Error::InvalidEntry`] if there is no `user@domain` component
    /// or if a `..` element would escape the root.
    pub fn parse(s: &str) -> Result<PathName> {
        let (user_part, rest) = match s.find('/') {
            Some(idx) => (&s[..idx], &s[idx + 1..]),
            None => (s, ""),
        };
        if !user_part.contains('@') || user_part.is_empty() {
            return Err(Error::InvalidEntry {
                name: PathName::root_unchecked(user_part),
                reason: "missing user@domain component".to_string(),
            });
        }
        let user = UserName(user_part.to_string());
        let mut elems: Vec<String> = Vec::new();
        for part in rest.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    if elems.pop().is_none() {
                        return Err(Error::InvalidEntry {
                            name: PathName::root_unchecked(user_part),
                            reason: "'..' escapes the user root".to_string(),
                        });
                    }
                }
                elem => elems.push(elem.to_string()),
            }
        }
        Ok(PathName { user, elems })
    }

    /// Build a root path name for `user`, trusting the caller that `user`
    /// already looks like `name@domain`. Used only to attach a name to an
    /// error when parsing fails.
    fn root_unchecked(user: &str) -> PathName {
        PathName {
            user: UserName(user.to_string()),
            elems: Vec::new(),
        }
    }

    pub fn root(user: UserName) -> PathName {
        PathName {
            user,
            elems: Vec::new(),
        }
    }

    pub fn user(&self) -> &UserName {
        &self.user
    }

    pub fn is_root(&self) -> bool {
        self.elems.is_empty()
    }

    /// The final path element, or `None` at the root.
    pub fn base(&self) -> Option<&str> {
        self.elems.last().map(String::as_str)
    }

    /// The parent of this path, or `None` if this is already the root.
    pub fn parent(&self) -> Option<PathName> {
        if self.elems.is_empty() {
            None
        } else {
            Some(PathName {
                user: self.user.clone(),
                elems: self.elems[..self.elems.len() - 1].to_vec(),
            })
        }
    }

    /// Build the path for `self/elem`.
    pub fn join(&self, elem: &str) -> PathName {
        let mut elems = self.elems.clone();
        elems.push(elem.to_string());
        PathName {
            user: self.user.clone(),
            elems,
        }
    }

    /// True if `self` is `other` or a descendant of `other`.
    pub fn is_descendant_of(&self, other: &PathName) -> bool {
        self.user == other.user
            && self.elems.len() >= other.elems.len()
            && self.elems[..other.elems.len()] == other.elems[..]
    }

    /// True if the base name is exactly `Access`.
    pub fn is_access_file(&self) -> bool {
        self.base() == Some("Access")
    }
}

impl fmt::Display for PathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user)?;
        for elem in &self.elems {
            write!(f, "/{elem}")?;
        }
        Ok(())
    }
}

/// A cacheable glob pattern: exactly one trailing `*` and nothing else that
/// could match more than the direct children of `dir`.
///
/// Per spec 4.3, only `dir/*` is cacheable; any other metacharacter usage
/// always falls through to upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheableGlob {
    pub dir: PathName,
}

impl CacheableGlob {
    /// Returns `Some` if `pattern` is of the cacheable `dir/*` shape.
    pub fn parse(pattern: &str) -> Option<CacheableGlob> {
        let stripped = pattern.strip_suffix('*')?;
        let dir_str = stripped.strip_suffix('/')?;
        if pattern[..pattern.len() - 1].contains('*') || pattern.contains(['?', '[', ']']) {
            return None;
        }
        let dir = PathName::parse(dir_str).ok()?;
        Some(CacheableGlob { dir })
    }
}
