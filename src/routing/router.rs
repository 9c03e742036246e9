//! Path trie.
//!
//! # Responsibilities
//! - Compile `HttpRule`s into a tree of literal segments, verbs and variables
//! - Remove every route bound to a method name, pruning empty nodes
//! - Match a request path and HTTP verb to a [`Binding`]
//!
//! # Matching
//! ```text
//! "/v1/shelves/1/books/2:get"
//!   node ──"/v1"──▶ node ──{name=shelves/*/books/*}──▶ node ──":get"──▶ methods["GET"]
//! ```
//! Literal children are tried before variables. Every variable at a node
//! proposes the spans it can consume; spans are tried longest first, with
//! declaration order breaking ties, and a failed subtree backtracks to the
//! next candidate.
//!
//! # Design Decisions
//! - Literal keys keep their leading `/` (or `:` for verbs) so the verb
//!   suffix is just another edge
//! - Nodes derive `Clone` and `PartialEq`; descriptors and token patterns
//!   sit behind `Arc` and are shared between snapshots

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use prost_reflect::{Kind, MessageDescriptor, MethodDescriptor};
use tonic::Status;

use crate::error::{GatewayError, RuleError};
use crate::routing::lexer::{Token, TokenKind};
use crate::routing::params::{resolve_field_path, FieldPath, Params};
use crate::routing::rule::HttpRule;
use crate::routing::template::{self, Segment};

/// Verb key that matches any HTTP method.
pub const ANY_VERB: &str = "*";

/// Verb used when a request asks for a WebSocket upgrade.
pub const WEBSOCKET_VERB: &str = "WEBSOCKET";

/// Why a request path did not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
}

impl RouteError {
    fn most_specific(self, other: RouteError) -> RouteError {
        match (self, other) {
            (RouteError::MethodNotAllowed, _) | (_, RouteError::MethodNotAllowed) => {
                RouteError::MethodNotAllowed
            }
            _ => RouteError::NotFound,
        }
    }
}

impl From<RouteError> for Status {
    fn from(err: RouteError) -> Self {
        Status::not_found(err.to_string())
    }
}

/// A compiled route target.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Handler key, `/pkg.Service/Method`.
    pub name: String,
    pub desc: MethodDescriptor,
    /// `None` when the request has no body, empty for the whole message.
    pub body: Option<FieldPath>,
    /// Response sub-message written as the body, empty for the whole message.
    pub response: FieldPath,
    /// Field path of every variable in path order. Anonymous wildcards
    /// have `None` and their capture is dropped.
    pub vars: Vec<Option<FieldPath>>,
}

impl Binding {
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Variable {
    name: String,
    pattern: Arc<[Token]>,
    next: Path,
}

/// Trie node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Path {
    segments: HashMap<String, Path>,
    variables: Vec<Variable>,
    methods: HashMap<String, Arc<Binding>>,
}

/// A successful match: the binding plus raw captures in path order.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub binding: Arc<Binding>,
    captures: Vec<String>,
}

impl RouteMatch {
    /// Decode the captures into typed params for the binding's input.
    pub fn params(&self) -> Result<Params, Status> {
        let mut params = Params::new();
        for (capture, var) in self.captures.iter().zip(&self.binding.vars) {
            let Some(path) = var else { continue };
            let value = percent_decode_str(capture).decode_utf8().map_err(|err| {
                Status::invalid_argument(format!("invalid path segment {capture:?}: {err}"))
            })?;
            params.push_raw(path.clone(), &value)?;
        }
        Ok(params)
    }

    pub fn captures(&self) -> &[String] {
        &self.captures
    }
}

impl Path {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.variables.is_empty() && self.methods.is_empty()
    }

    /// Compile `rule` and its additional bindings for the method `name`.
    pub fn add_rule(
        &mut self,
        rule: &HttpRule,
        desc: &MethodDescriptor,
        name: &str,
    ) -> Result<(), GatewayError> {
        let invalid = |rule: &HttpRule, source: RuleError| GatewayError::InvalidRule {
            method: name.to_string(),
            rule: rule.to_string(),
            source,
        };

        for binding in &rule.additional_bindings {
            if !binding.additional_bindings.is_empty() {
                return Err(invalid(binding, RuleError::NestedBindings));
            }
        }

        self.add_binding(rule, desc, name)
            .map_err(|err| invalid(rule, err))?;
        for binding in &rule.additional_bindings {
            self.add_binding(binding, desc, name)
                .map_err(|err| invalid(binding, err))?;
        }
        Ok(())
    }

    fn add_binding(
        &mut self,
        rule: &HttpRule,
        desc: &MethodDescriptor,
        name: &str,
    ) -> Result<(), RuleError> {
        let (verb, template) = rule.verb_and_template().ok_or(RuleError::MissingPattern)?;
        let template = template::parse(template)?;
        let input = desc.input();

        let mut vars = Vec::new();
        for segment in &template.segments {
            if let Segment::Variable(spec) = segment {
                vars.push(if spec.field_path.is_empty() {
                    None
                } else {
                    Some(resolve_field_path(&input, &spec.field_path)?)
                });
            }
        }
        let body = match rule.body.as_str() {
            "" => None,
            "*" => Some(Vec::new()),
            body => Some(message_path(&input, body)?),
        };
        let response = match rule.response_body.as_str() {
            "" | "*" => Vec::new(),
            path => message_path(&desc.output(), path)?,
        };
        let key = match verb {
            ANY_VERB => ANY_VERB.to_string(),
            verb => verb.to_uppercase(),
        };

        let mut node = self;
        for segment in &template.segments {
            node = match segment {
                Segment::Literal(lit) => node.segments.entry(format!("/{lit}")).or_default(),
                Segment::Variable(spec) => {
                    let var_name = spec.name();
                    let index = match node
                        .variables
                        .iter()
                        .position(|v| v.name == var_name && v.pattern == spec.pattern)
                    {
                        Some(index) => index,
                        None => {
                            node.variables.push(Variable {
                                name: var_name,
                                pattern: Arc::clone(&spec.pattern),
                                next: Path::default(),
                            });
                            node.variables.len() - 1
                        }
                    };
                    &mut node.variables[index].next
                }
            };
        }
        if let Some(verb) = &template.verb {
            node = node.segments.entry(format!(":{verb}")).or_default();
        }

        if let Some(existing) = node.methods.get(&key) {
            if existing.name != name {
                return Err(RuleError::Duplicate(existing.name.clone()));
            }
        }
        node.methods.insert(
            key,
            Arc::new(Binding {
                name: name.to_string(),
                desc: desc.clone(),
                body,
                response,
                vars,
            }),
        );
        Ok(())
    }

    /// Remove every route bound to `name`. Returns whether anything was removed.
    pub fn del_rule(&mut self, name: &str) -> bool {
        let mut removed = false;
        self.methods.retain(|_, binding| {
            let keep = binding.name != name;
            removed |= !keep;
            keep
        });
        self.segments.retain(|_, child| {
            removed |= child.del_rule(name);
            !child.is_empty()
        });
        self.variables.retain_mut(|var| {
            removed |= var.next.del_rule(name);
            !var.next.is_empty()
        });
        removed
    }

    /// Resolve a request path and verb.
    pub fn find(&self, path: &str, verb: &str) -> Result<RouteMatch, RouteError> {
        let mut captures = Vec::new();
        let binding = self.search(path, verb, &mut captures)?;
        Ok(RouteMatch {
            binding: Arc::clone(binding),
            captures: captures.into_iter().map(str::to_string).collect(),
        })
    }

    fn search<'p, 's>(
        &'p self,
        route: &'s str,
        verb: &str,
        captures: &mut Vec<&'s str>,
    ) -> Result<&'p Arc<Binding>, RouteError> {
        if route.is_empty() {
            return match self.methods.get(verb).or_else(|| self.methods.get(ANY_VERB)) {
                Some(binding) => Ok(binding),
                None if self.methods.is_empty() => Err(RouteError::NotFound),
                None => Err(RouteError::MethodNotAllowed),
            };
        }

        let mut err = RouteError::NotFound;
        if let Some(key) = next_literal(route) {
            if let Some(child) = self.segments.get(key) {
                match child.search(&route[key.len()..], verb, captures) {
                    Ok(binding) => return Ok(binding),
                    Err(e) => err = err.most_specific(e),
                }
            }
        }

        let Some(rest) = route.strip_prefix('/') else {
            return Err(err);
        };
        let mut candidates = Vec::new();
        for (index, var) in self.variables.iter().enumerate() {
            let mut ends = Vec::new();
            pattern_ends(&var.pattern, rest, 0, &mut ends);
            ends.sort_unstable();
            ends.dedup();
            candidates.extend(ends.into_iter().map(|end| (end, index)));
        }
        // Stable sort keeps declaration order among equal spans.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (end, index) in candidates {
            captures.push(&rest[..end]);
            match self.variables[index].next.search(&rest[end..], verb, captures) {
                Ok(binding) => return Ok(binding),
                Err(e) => {
                    captures.pop();
                    err = err.most_specific(e);
                }
            }
        }
        Err(err)
    }

    /// Visit every binding in the trie.
    pub fn bindings(&self) -> Vec<Arc<Binding>> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<Arc<Binding>>) {
        out.extend(self.methods.values().cloned());
        for child in self.segments.values() {
            child.collect(out);
        }
        for var in &self.variables {
            var.next.collect(out);
        }
    }
}

/// The literal edge at the head of `route`: `/segment` or the `:verb` tail.
fn next_literal(route: &str) -> Option<&str> {
    if route.starts_with(':') {
        return Some(route);
    }
    let rest = route.strip_prefix('/')?;
    let end = rest.find(['/', ':']).unwrap_or(rest.len());
    Some(&route[..end + 1])
}

/// Push every end offset in `s` at which `tokens` can stop matching.
fn pattern_ends(tokens: &[Token], s: &str, pos: usize, out: &mut Vec<usize>) {
    let Some((token, tail)) = tokens.split_first() else {
        if pos == s.len() || matches!(s.as_bytes()[pos], b'/' | b':') {
            out.push(pos);
        }
        return;
    };
    let rest = &s[pos..];
    match token.kind {
        TokenKind::Value => {
            if rest.starts_with(token.val.as_str()) {
                pattern_ends(tail, s, pos + token.val.len(), out);
            }
        }
        TokenKind::Slash => {
            if rest.starts_with('/') {
                pattern_ends(tail, s, pos + 1, out);
            }
        }
        TokenKind::Star => {
            let segment = rest.find('/').unwrap_or(rest.len());
            for (i, b) in rest[..segment].bytes().enumerate().skip(1) {
                if b == b':' {
                    pattern_ends(tail, s, pos + i, out);
                }
            }
            if segment > 0 {
                pattern_ends(tail, s, pos + segment, out);
            }
        }
        TokenKind::StarStar => {
            for (i, b) in rest.bytes().enumerate().skip(1) {
                if b == b'/' || b == b':' {
                    pattern_ends(tail, s, pos + i, out);
                }
            }
            if !rest.is_empty() {
                pattern_ends(tail, s, pos + rest.len(), out);
            }
        }
        _ => {}
    }
}

/// Resolve a dotted body path whose every field is a singular message.
fn message_path(desc: &MessageDescriptor, path: &str) -> Result<FieldPath, RuleError> {
    let names: Vec<&str> = path.split('.').collect();
    let fields = resolve_field_path(desc, &names)?;
    for field in &fields {
        if field.is_list() || field.is_map() || !matches!(field.kind(), Kind::Message(_)) {
            return Err(RuleError::NotMessage(field.full_name().to_string()));
        }
    }
    Ok(fields)
}
