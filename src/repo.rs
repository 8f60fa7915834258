//! Repository name parsing
//!
//! A repository reference such as `alpine`, `user/app` or
//! `registry.example.com:5000/team/app` is resolved into the index host the
//! client talks to and the remote name used in every `/v2/<name>/...` URL.
//! Tag and digest suffixes are not part of a repository name, callers pass
//! them separately.

use std::fmt;
use std::str::FromStr;

use crate::regexp;

/// Index host used when a reference carries no explicit registry host.
pub const DEFAULT_INDEX_HOST: &str = "docker.io";

/// API endpoint serving the v2 protocol for [`DEFAULT_INDEX_HOST`].
pub const DEFAULT_REGISTRY_ENDPOINT: &str = "registry-1.docker.io";

/// Implicit namespace of single-segment ("official") names on the default index.
pub const OFFICIAL_NAMESPACE: &str = "library";

/// Aliases that all designate the default index.
const DEFAULT_INDEX_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// The repository reference could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid repository name {input:?}: {reason}")]
pub struct InvalidRepoNameError {
    /// The rejected input
    pub input: String,
    /// Why it was rejected
    pub reason: String,
}

/// Structured coordinates of a repository, produced by [`parse_repo`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoCoordinates {
    index_host: String,
    official_name: Option<String>,
    remote_name: String,
}

impl RepoCoordinates {
    /// Host of the index the repository lives on, e.g. `docker.io` or
    /// `localhost:5000`.
    pub fn index_host(&self) -> &str {
        &self.index_host
    }

    /// The unexpanded name of an official repository (`alpine` for
    /// `library/alpine`), `None` for everything else.
    pub fn official_name(&self) -> Option<&str> {
        self.official_name.as_deref()
    }

    /// Path of the repository in v2 API URLs, e.g. `library/alpine`.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Whether this is an official repository of the default index
    pub fn is_official(&self) -> bool {
        self.official_name.is_some()
    }

    /// Host serving the v2 API for this repository.
    ///
    /// The default index is served from a different host than its name.
    pub fn registry_endpoint(&self) -> &str {
        if self.index_host == DEFAULT_INDEX_HOST {
            DEFAULT_REGISTRY_ENDPOINT
        } else {
            &self.index_host
        }
    }

    /// Fully qualified name, `<index host>/<remote name>`
    pub fn canonical_name(&self) -> String {
        format!("{}/{}", self.index_host, self.remote_name)
    }

    /// Short name suitable for display: the official name when there is one,
    /// the remote name on the default index, the canonical name otherwise.
    pub fn display_name(&self) -> String {
        match (&self.official_name, self.index_host.as_str()) {
            (Some(official), _) => official.clone(),
            (None, DEFAULT_INDEX_HOST) => self.remote_name.clone(),
            (None, _) => self.canonical_name(),
        }
    }
}

impl fmt::Display for RepoCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_name())
    }
}

impl FromStr for RepoCoordinates {
    type Err = InvalidRepoNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_repo(s)
    }
}

impl TryFrom<&str> for RepoCoordinates {
    type Error = InvalidRepoNameError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        parse_repo(s)
    }
}

/// Parse a repository reference into [`RepoCoordinates`].
///
/// The first path segment is treated as a registry host when it contains a
/// `.` or a `:`, or equals `localhost`. Otherwise the whole input is a name on
/// the default index, and single-segment names there are official names
/// expanded under [`OFFICIAL_NAMESPACE`].
pub fn parse_repo(input: &str) -> Result<RepoCoordinates, InvalidRepoNameError> {
    let invalid = |reason: String| InvalidRepoNameError {
        input: input.to_string(),
        reason,
    };

    if input.is_empty() {
        return Err(invalid("repository name is empty".to_string()));
    }
    if input.contains("://") {
        return Err(invalid(
            "a URL scheme is not part of a repository name".to_string(),
        ));
    }

    let (index_host, remainder) = match input.split_once('/') {
        Some((first, rest)) if looks_like_host(first) => {
            if !regexp::HOST.is_match(first) {
                return Err(invalid(format!("invalid index host {:?}", first)));
            }
            (normalize_index_host(first), rest)
        }
        _ => (DEFAULT_INDEX_HOST.to_string(), input),
    };

    if remainder.is_empty() {
        return Err(invalid("missing repository path after index host".to_string()));
    }
    if remainder.len() > regexp::NAME_TOTAL_LENGTH_MAX {
        return Err(invalid(format!(
            "repository path is longer than {} characters",
            regexp::NAME_TOTAL_LENGTH_MAX
        )));
    }
    for component in remainder.split('/') {
        if component.is_empty() {
            return Err(invalid("empty path component".to_string()));
        }
        if !regexp::PATH_COMPONENT.is_match(component) {
            return Err(invalid(format!(
                "path component {:?} may only contain lowercase letters, digits and separators",
                component
            )));
        }
    }

    let (official_name, remote_name) = if index_host == DEFAULT_INDEX_HOST {
        match remainder.split_once('/') {
            None => (
                Some(remainder.to_string()),
                format!("{}/{}", OFFICIAL_NAMESPACE, remainder),
            ),
            Some((OFFICIAL_NAMESPACE, name)) if !name.contains('/') => {
                (Some(name.to_string()), remainder.to_string())
            }
            Some(_) => (None, remainder.to_string()),
        }
    } else {
        (None, remainder.to_string())
    };

    Ok(RepoCoordinates {
        index_host,
        official_name,
        remote_name,
    })
}

fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn normalize_index_host(host: &str) -> String {
    if DEFAULT_INDEX_ALIASES
        .iter()
        .any(|alias| alias.eq_ignore_ascii_case(host))
    {
        DEFAULT_INDEX_HOST.to_string()
    } else {
        host.to_string()
    }
}
