// src/reference.rs
//! Entity references: `cs:[~user/][series/]name[-revision]`
//!
//! Two entry points:
//! - [`EntityReference::split_path`] parses the leading part of a request path and
//!   hands back whatever follows the reference (`"meta/any"`, `"archive/icon.svg"`, ...).
//! - `str::parse` reads the canonical string form used in JSON envelopes.
//!
//! In a request path the series is optional, so a segment is only taken as a
//! series when it is one of [`KNOWN_SERIES`] and something follows it;
//! `wordpress/meta` is the entity `wordpress` with remainder `meta`.

use crate::constants::{BUNDLE_SERIES, REFERENCE_SCHEMA};
use crate::error::StoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Series recognised in request paths
pub const KNOWN_SERIES: &[&str] = &[
    "bundle", "precise", "quantal", "raring", "saucy", "trusty", "utopic", "vivid", "wily",
    "xenial", "yakkety", "zesty", "artful", "bionic", "cosmic", "disco", "eoan", "focal",
    "groovy", "hirsute", "impish", "jammy", "kinetic", "lunar", "mantic", "noble", "oneiric",
    "centos7", "win2012", "win2012r2", "kubernetes",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityReference {
    pub user: Option<String>,
    pub series: Option<String>,
    pub name: String,
    /// `None` means "latest" when resolving and is required when uploading
    pub revision: Option<u32>,
}

impl EntityReference {
    pub fn new(user: Option<&str>, series: Option<&str>, name: &str, revision: Option<u32>) -> Self {
        Self {
            user: user.map(str::to_string),
            series: series.map(str::to_string),
            name: name.to_string(),
            revision,
        }
    }

    /// Parse the reference at the start of `path`, returning it with the
    /// unconsumed remainder (no leading slash).
    pub fn split_path(path: &str) -> Result<(EntityReference, &str), StoreError> {
        let path = path.trim_start_matches('/');
        let (mut segment, mut rest) = split_first(path);

        let mut user = None;
        if let Some(name) = segment.strip_prefix('~') {
            if !is_valid_user(name) {
                return Err(StoreError::InvalidReference(format!(
                    "charm URL has invalid user name: {:?}",
                    path
                )));
            }
            user = Some(name.to_string());
            (segment, rest) = split_first(rest);
        }

        let mut series = None;
        if !rest.is_empty() && KNOWN_SERIES.contains(&segment) {
            series = Some(segment.to_string());
            (segment, rest) = split_first(rest);
        }

        let (name, revision) = parse_name_revision(segment)?;
        Ok((
            EntityReference {
                user,
                series,
                name,
                revision,
            },
            rest,
        ))
    }

    /// Reference with series and revision stripped; the key "latest"
    /// resolution groups on.
    pub fn base(&self) -> EntityReference {
        EntityReference {
            user: self.user.clone(),
            series: None,
            name: self.name.clone(),
            revision: None,
        }
    }

    pub fn with_revision(&self, revision: u32) -> EntityReference {
        EntityReference {
            revision: Some(revision),
            ..self.clone()
        }
    }

    pub fn is_bundle(&self) -> bool {
        self.series.as_deref() == Some(BUNDLE_SERIES)
    }

    /// Fully specified: series and revision both set
    pub fn is_concrete(&self) -> bool {
        self.series.is_some() && self.revision.is_some()
    }

    /// Path form, e.g. `~bob/trusty/wordpress-3`
    pub fn path(&self) -> String {
        let mut out = String::new();
        if let Some(user) = &self.user {
            out.push('~');
            out.push_str(user);
            out.push('/');
        }
        if let Some(series) = &self.series {
            out.push_str(series);
            out.push('/');
        }
        out.push_str(&self.name);
        if let Some(revision) = self.revision {
            out.push('-');
            out.push_str(&revision.to_string());
        }
        out
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", REFERENCE_SCHEMA, self.path())
    }
}

impl FromStr for EntityReference {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(REFERENCE_SCHEMA)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(s);

        let mut segments: Vec<&str> = body.split('/').collect();
        let mut user = None;
        if let Some(first) = segments.first() {
            if let Some(name) = first.strip_prefix('~') {
                if !is_valid_user(name) {
                    return Err(StoreError::InvalidReference(format!(
                        "charm URL has invalid user name: {:?}",
                        s
                    )));
                }
                user = Some(name.to_string());
                segments.remove(0);
            }
        }

        let (series, token) = match segments.as_slice() {
            [token] => (None, *token),
            [series, token] => {
                if !is_valid_series(series) {
                    return Err(StoreError::InvalidReference(format!(
                        "charm URL has invalid series: {:?}",
                        s
                    )));
                }
                (Some(series.to_string()), *token)
            }
            _ => {
                return Err(StoreError::InvalidReference(format!(
                    "charm URL has invalid form: {:?}",
                    s
                )))
            }
        };

        let (name, revision) = parse_name_revision(token)?;
        Ok(EntityReference {
            user,
            series,
            name,
            revision,
        })
    }
}

impl Serialize for EntityReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn split_first(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((head, tail)) => (head, tail),
        None => (path, ""),
    }
}

fn parse_name_revision(token: &str) -> Result<(String, Option<u32>), StoreError> {
    let (name, revision) = match token.rsplit_once('-') {
        Some((name, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
            let revision = rev.parse::<u32>().map_err(|_| {
                StoreError::InvalidReference(format!("charm URL has invalid revision: {:?}", token))
            })?;
            (name, Some(revision))
        }
        _ => (token, None),
    };
    if !is_valid_name(name) {
        return Err(StoreError::InvalidReference(format!(
            "charm URL has invalid charm name: {:?}",
            name
        )));
    }
    Ok((name.to_string(), revision))
}

/// `[a-z][a-z0-9]*(-[a-z0-9]*[a-z][a-z0-9]*)*`: lower-case words joined by
/// single hyphens, each word after the first containing a letter, so a
/// trailing `-<digits>` always reads as a revision.
pub fn is_valid_name(name: &str) -> bool {
    let mut words = name.split('-');
    let first = match words.next() {
        Some(first) => first,
        None => return false,
    };
    let lower_alnum = |w: &str| w.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if first.is_empty() || !first.as_bytes()[0].is_ascii_lowercase() || !lower_alnum(first) {
        return false;
    }
    words.all(|w| lower_alnum(w) && w.bytes().any(|b| b.is_ascii_lowercase()))
}

/// Starts and ends with a lower-case letter or digit; may contain `+ . -` inside
pub fn is_valid_user(user: &str) -> bool {
    let bytes = user.as_bytes();
    let (first, last) = match (bytes.first(), bytes.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return false,
    };
    let edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    edge(first)
        && edge(last)
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'.' || b == b'-')
}

/// `[a-z]+[a-z0-9]*`
pub fn is_valid_series(series: &str) -> bool {
    let bytes = series.as_bytes();
    !bytes.is_empty()
        && bytes[0].is_ascii_lowercase()
        && bytes.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
