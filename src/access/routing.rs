use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{PermissionRequirement, ResourceDelta};

// key: access-routing -> path normalization, endpoint sets, longest-prefix route trie

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Any,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
            Verb::Head => "HEAD",
            Verb::Options => "OPTIONS",
            Verb::Any => "*",
        }
    }

    /// `self` is the configured verb, `requested` the verb of the action.
    pub fn accepts(&self, requested: Verb) -> bool {
        *self == Verb::Any || *self == requested
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" => Ok(Verb::Delete),
            "HEAD" => Ok(Verb::Head),
            "OPTIONS" => Ok(Verb::Options),
            "*" | "ANY" => Ok(Verb::Any),
            other => Err(format!("unsupported verb `{other}`")),
        }
    }
}

impl TryFrom<String> for Verb {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Verb> for String {
    fn from(verb: Verb) -> Self {
        verb.as_str().to_string()
    }
}

/// Drops scheme/host, query string and fragment, then splits into non-empty segments.
pub fn path_segments(raw: &str) -> Vec<&str> {
    let mut path = raw.trim();
    if let Some((_, rest)) = path.split_once("://") {
        path = rest.find('/').map_or("", |index| &rest[index..]);
    }
    let end = path.find(|c: char| c == '?' || c == '#').unwrap_or(path.len());
    path[..end]
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Segments used for route lookup: the first `depth` segments of the path.
pub fn normalize_prefix(raw: &str, depth: usize) -> Vec<&str> {
    let mut segments = path_segments(raw);
    segments.truncate(depth);
    segments
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Param,
}

impl Segment {
    fn parse(raw: &str) -> Self {
        if raw.starts_with(':') || raw == "*" {
            Segment::Param
        } else {
            Segment::Literal(raw.to_string())
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Segment::Literal(literal) => literal == candidate,
            Segment::Param => true,
        }
    }
}

/// `VERB /path/prefix` (or a bare `/path/prefix` for any verb) matched on whole segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    verb: Verb,
    segments: Vec<Segment>,
    raw: String,
}

impl EndpointPattern {
    pub fn matches(&self, verb: Verb, path: &str) -> bool {
        if !self.verb.accepts(verb) {
            return false;
        }
        let requested = path_segments(path);
        requested.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(requested.iter())
                .all(|(segment, candidate)| segment.matches(candidate))
    }
}

impl FromStr for EndpointPattern {
    type Err = RouteTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (verb, path) = match raw.split_once(char::is_whitespace) {
            Some((verb, path)) => (
                verb.parse::<Verb>().map_err(RouteTableError::InvalidVerb)?,
                path.trim(),
            ),
            None => (Verb::Any, raw),
        };
        let segments: Vec<Segment> = path_segments(path).into_iter().map(Segment::parse).collect();
        if segments.is_empty() {
            return Err(RouteTableError::EmptyPattern(raw.to_string()));
        }
        Ok(Self {
            verb,
            segments,
            raw: raw.to_string(),
        })
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndpointSet {
    patterns: Vec<EndpointPattern>,
}

impl EndpointSet {
    pub fn parse<I, S>(entries: I) -> Result<Self, RouteTableError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = entries
            .into_iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, verb: Verb, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches(verb, path))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("route pattern `{0}` has no segments")]
    EmptyPattern(String),
    #[error("route pattern `{pattern}` is deeper than the prefix depth {depth}")]
    TooDeep { pattern: String, depth: usize },
    #[error("duplicate route `{verb} {pattern}`")]
    Duplicate { pattern: String, verb: Verb },
    #[error("{0}")]
    InvalidVerb(String),
}

/// key: access-route-rule -> static permission requirement for (pattern, verb)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub pattern: String,
    pub verb: Verb,
    pub requirement: Option<PermissionRequirement>,
    pub consumes: Option<ResourceDelta>,
}

impl RouteRule {
    pub fn new(verb: Verb, pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            verb,
            requirement: None,
            consumes: None,
        }
    }

    pub fn requires(mut self, requirement: PermissionRequirement) -> Self {
        self.requirement = Some(requirement);
        self
    }

    pub fn consumes(mut self, delta: ResourceDelta) -> Self {
        self.consumes = Some(delta);
        self
    }
}

/// Rule resolved for a request. `exact` is set when the rule's pattern covers
/// every segment of the request path rather than a leading prefix of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub rule: &'a RouteRule,
    pub exact: bool,
}

#[derive(Debug, Clone, Default)]
struct RouteNode {
    literals: HashMap<String, RouteNode>,
    param: Option<Box<RouteNode>>,
    rules: HashMap<Verb, RouteRule>,
}

impl RouteNode {
    fn rule_for(&self, verb: Verb) -> Option<&RouteRule> {
        self.rules.get(&verb).or_else(|| self.rules.get(&Verb::Any))
    }

    fn search<'a>(
        &'a self,
        segments: &[&str],
        depth: usize,
        verb: Verb,
        best: &mut Option<(usize, &'a RouteRule)>,
    ) {
        if let Some(rule) = self.rule_for(verb) {
            if best.map_or(true, |(best_depth, _)| depth > best_depth) {
                *best = Some((depth, rule));
            }
        }
        let Some((head, rest)) = segments.split_first() else {
            return;
        };
        if let Some(child) = self.literals.get(*head) {
            child.search(rest, depth + 1, verb, best);
        }
        if let Some(child) = self.param.as_deref() {
            child.search(rest, depth + 1, verb, best);
        }
    }
}

/// Segment trie resolving a request to the deepest matching rule.
/// Literal segments are explored before `:param` segments and only a strictly
/// deeper match replaces an earlier one, so lookups do not depend on the order
/// rules were added in.
#[derive(Debug, Clone)]
pub struct RouteTable {
    root: RouteNode,
    prefix_depth: usize,
    len: usize,
}

impl RouteTable {
    pub fn builder(prefix_depth: usize) -> RouteTableBuilder {
        RouteTableBuilder {
            prefix_depth: prefix_depth.max(1),
            rules: Vec::new(),
        }
    }

    pub fn resolve(&self, path: &str, verb: Verb) -> Option<&RouteRule> {
        self.lookup(path, verb).map(|matched| matched.rule)
    }

    pub fn lookup(&self, path: &str, verb: Verb) -> Option<RouteMatch<'_>> {
        let segments = normalize_prefix(path, self.prefix_depth);
        let mut best = None;
        self.root.search(&segments, 0, verb, &mut best);
        let (depth, rule) = best?;
        Some(RouteMatch {
            rule,
            exact: depth == path_segments(path).len(),
        })
    }

    /// Permission required for `(path, verb)`; `None` means unrestricted.
    pub fn requirement_for(&self, path: &str, verb: Verb) -> Option<&PermissionRequirement> {
        self.resolve(path, verb)
            .and_then(|rule| rule.requirement.as_ref())
    }

    pub fn prefix_depth(&self) -> usize {
        self.prefix_depth
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone)]
pub struct RouteTableBuilder {
    prefix_depth: usize,
    rules: Vec<RouteRule>,
}

impl RouteTableBuilder {
    pub fn route(mut self, rule: RouteRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn build(self) -> Result<RouteTable, RouteTableError> {
        let mut root = RouteNode::default();
        let mut len = 0;
        for rule in self.rules {
            let segments: Vec<Segment> = path_segments(&rule.pattern)
                .into_iter()
                .map(Segment::parse)
                .collect();
            if segments.is_empty() {
                return Err(RouteTableError::EmptyPattern(rule.pattern));
            }
            if segments.len() > self.prefix_depth {
                return Err(RouteTableError::TooDeep {
                    pattern: rule.pattern,
                    depth: self.prefix_depth,
                });
            }

            let mut node = &mut root;
            for segment in segments {
                node = match segment {
                    Segment::Literal(literal) => node.literals.entry(literal).or_default(),
                    Segment::Param => &mut **node.param.get_or_insert_with(Box::default),
                };
            }
            if node.rules.contains_key(&rule.verb) {
                return Err(RouteTableError::Duplicate {
                    pattern: rule.pattern,
                    verb: rule.verb,
                });
            }
            node.rules.insert(rule.verb, rule);
            len += 1;
        }
        Ok(RouteTable {
            root,
            prefix_depth: self.prefix_depth,
            len,
        })
    }
}
