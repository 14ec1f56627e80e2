//! Repository reference grammar.
//!
//! Turns the identifiers users paste (short names, web URLs, SSH remotes) into a
//! canonical [`RepoReference`]. The grammar is a list of independent rules
//! tried in order; the first rule that recognizes the shape of the input
//! decides the result, so a malformed URL is reported as such instead of
//! falling through to a looser rule.
//!
//! ```text
//! 1. ssh        git@<host>:<owner>/<name>[.git]
//! 2. host path  [<scheme>://][<user>@]<host>[:<port>]/<owner>/<name>[.git][/...]
//! 3. short      <owner>/<name>[.git]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use url::Url;

use crate::types::{Owner, ParseError, Repo, RepoKey};

/// Host assumed for the short `owner/name` form.
pub const DEFAULT_HOST: &str = "github.com";

const SCHEMES: &[&str] = &["https", "http", "ssh", "git"];

/// Which grammar rule produced a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceForm {
    Ssh,
    HostPath,
    Short,
}

/// A parsed, canonical repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoReference {
    /// Canonical `owner/name` key.
    pub key: RepoKey,
    /// Host the repository lives on (may include a port).
    pub host: String,
    /// HTTPS URL handed to `git clone`.
    pub clone_url: String,
    /// Rule that matched the input.
    pub form: ReferenceForm,
}

impl RepoReference {
    fn new(host: &str, owner: &str, name: &str, form: ReferenceForm) -> Result<Self, ParseError> {
        validate_host(host)?;
        let owner = owner
            .parse::<Owner>()
            .map_err(|e| ParseError::InvalidOwner(Box::new(e)))?;
        let name = name.strip_suffix(".git").unwrap_or(name);
        let repo = name
            .parse::<Repo>()
            .map_err(|e| ParseError::InvalidRepo(Box::new(e)))?;

        let clone_url = format!("https://{host}/{owner}/{repo}.git");
        Ok(Self {
            key: RepoKey::new(owner, repo),
            host: host.to_string(),
            clone_url,
            form,
        })
    }

    pub fn owner(&self) -> &Owner {
        &self.key.owner
    }

    pub fn name(&self) -> &Repo {
        &self.key.repo
    }
}

impl FromStr for RepoReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_reference(s)
    }
}

impl fmt::Display for RepoReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// A grammar rule: `None` when the input is not of this rule's shape,
/// `Some(result)` when the rule owns the input.
type Rule = fn(&str) -> Option<Result<RepoReference, ParseError>>;

const RULES: &[Rule] = &[parse_ssh, parse_host_path, parse_short];

/// Parse any accepted reference form into a canonical reference.
pub fn parse_reference(input: &str) -> Result<RepoReference, ParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParseError::Empty);
    }

    for rule in RULES {
        if let Some(result) = rule(input) {
            return result;
        }
    }

    Err(ParseError::Unrecognized(input.to_string()))
}

/// `git@host:owner/name[.git]`
fn parse_ssh(input: &str) -> Option<Result<RepoReference, ParseError>> {
    let rest = input.strip_prefix("git@")?;
    Some(ssh_reference(input, rest))
}

fn ssh_reference(input: &str, rest: &str) -> Result<RepoReference, ParseError> {
    let (host, path) = rest
        .split_once(':')
        .ok_or_else(|| ParseError::Unrecognized(input.to_string()))?;
    let path = path.trim_end_matches('/');
    let (owner, name) = path.split_once('/').ok_or(ParseError::MissingSeparator)?;
    RepoReference::new(host, owner, name, ReferenceForm::Ssh)
}

/// `[scheme://][user@]host[:port]/owner/name[.git][/...]`
///
/// Without a scheme the rule only claims inputs whose first segment looks like
/// a host and that still have owner and name segments after it, so dotted
/// owners in short form (`my.org/repo`) are left to the short rule.
fn parse_host_path(input: &str) -> Option<Result<RepoReference, ParseError>> {
    let unrecognized = || ParseError::Unrecognized(input.to_string());

    let url = if input.contains("://") {
        let url = match Url::parse(input) {
            Ok(url) => url,
            Err(_) => return Some(Err(unrecognized())),
        };
        if !SCHEMES.contains(&url.scheme()) {
            return Some(Err(unrecognized()));
        }
        url
    } else {
        let authority = input.split('/').next().unwrap_or_default();
        let host = authority.rsplit_once('@').map_or(authority, |(_user, host)| host);
        if !looks_like_host(host) {
            return None;
        }
        let url = Url::parse(&format!("https://{input}")).ok()?;
        if path_segments(&url).len() < 2 {
            return None;
        }
        url
    };

    let Some(hostname) = url.host_str() else {
        return Some(Err(ParseError::InvalidHost(String::new())));
    };
    let host = match (url.scheme(), url.port()) {
        // ssh and git ports say nothing about where HTTPS is served.
        ("ssh" | "git", _) | (_, None) => hostname.to_string(),
        (_, Some(port)) => format!("{hostname}:{port}"),
    };

    Some(match path_segments(&url).as_slice() {
        [] => Err(unrecognized()),
        [_owner] => Err(ParseError::MissingSeparator),
        [owner, name, ..] => RepoReference::new(&host, owner, name, ReferenceForm::HostPath),
    })
}

/// Non-empty path segments, so trailing slashes don't count.
fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// `owner/name[.git]`
fn parse_short(input: &str) -> Option<Result<RepoReference, ParseError>> {
    let trimmed = input.trim_end_matches('/');
    let (owner, name) = trimmed.split_once('/')?;
    if name.contains('/') {
        return None;
    }
    Some(RepoReference::new(
        DEFAULT_HOST,
        owner,
        name,
        ReferenceForm::Short,
    ))
}

fn looks_like_host(host: &str) -> bool {
    let hostname = host.split(':').next().unwrap_or(host);
    hostname.contains('.') || hostname.eq_ignore_ascii_case("localhost")
}

fn validate_host(host: &str) -> Result<(), ParseError> {
    let valid = !host.is_empty()
        && !host.starts_with(['-', '.', ':'])
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidHost(host.to_string()))
    }
}
