//! Data mapping: binding expressions and the composite resolver
//!
//! Bindings are JSON values. A string that is exactly `${{ scope.path }}`
//! resolves to the typed value at that path; a string with embedded
//! templates interpolates them as text; arrays and objects are mapped
//! element by element; anything else is a static value.
//!
//! Scopes available by default:
//!
//! - `pipeline.<name>` - pipeline inputs and values produced by output bindings
//! - `stage.<stage>.<field>` - raw outputs of an earlier stage
//! - `activity.<field>` - outputs of the current activity (output bindings only)
//! - `env.<VAR>` - process environment variables
//!
//! Bindings are compiled once, when the definition is built. A reference
//! that resolves to nothing at run time yields `null` (or an empty string
//! inside a template).

use crate::core::context::DataScope;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

pub const PIPELINE_SCOPE: &str = "pipeline";
pub const STAGE_SCOPE: &str = "stage";
pub const ACTIVITY_SCOPE: &str = "activity";
pub const ENV_SCOPE: &str = "env";

/// Error raised while compiling binding expressions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("Invalid expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    #[error("Unknown scope '{scope}' in '{expr}'")]
    UnknownScope { scope: String, expr: String },

    #[error("Scope '{scope}' is not available in {context} bindings")]
    ScopeNotAllowed { scope: String, context: String },

    #[error("Reference '{0}' names an undeclared value")]
    Undeclared(String),
}

/// A parsed reference such as `stage.fetch.body.items.0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub scope: String,
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(expr: &str) -> Result<Self, MappingError> {
        let trimmed = expr.trim();
        let mut parts = trimmed.split('.');
        let scope = parts.next().unwrap_or_default().to_string();
        let path: Vec<String> = parts.map(str::to_string).collect();

        if scope.is_empty() || path.is_empty() {
            return Err(MappingError::Syntax {
                expr: trimmed.to_string(),
                reason: "expected '<scope>.<name>'".to_string(),
            });
        }
        if path.iter().any(|p| p.is_empty() || p.chars().any(char::is_whitespace)) {
            return Err(MappingError::Syntax {
                expr: trimmed.to_string(),
                reason: "empty or malformed path segment".to_string(),
            });
        }

        Ok(Self { scope, path })
    }

    /// First path segment (the value or stage name)
    pub fn name(&self) -> &str {
        &self.path[0]
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.scope, self.path.join("."))
    }
}

/// Data visible to a mapping evaluation
#[derive(Debug, Clone, Copy)]
pub struct MappingScope<'a> {
    pub data: &'a DataScope,
    pub activity: Option<&'a Map<String, Value>>,
}

impl<'a> MappingScope<'a> {
    pub fn new(data: &'a DataScope) -> Self {
        Self { data, activity: None }
    }

    pub fn with_activity(mut self, outputs: &'a Map<String, Value>) -> Self {
        self.activity = Some(outputs);
        self
    }
}

/// Resolves a path within one named scope
pub trait Resolver: Send + Sync {
    fn resolve(&self, scope: &MappingScope<'_>, path: &[String]) -> Option<Value>;
}

/// Walk a JSON value along a path of object keys and array indices
pub fn navigate<'v>(value: &'v Value, path: &[String]) -> Option<&'v Value> {
    let mut current = value;
    for part in path {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup_in(map: &Map<String, Value>, path: &[String]) -> Option<Value> {
    let (first, rest) = path.split_first()?;
    navigate(map.get(first)?, rest).cloned()
}

struct PipelineResolver;

impl Resolver for PipelineResolver {
    fn resolve(&self, scope: &MappingScope<'_>, path: &[String]) -> Option<Value> {
        lookup_in(&scope.data.values, path)
    }
}

struct StageResolver;

impl Resolver for StageResolver {
    fn resolve(&self, scope: &MappingScope<'_>, path: &[String]) -> Option<Value> {
        lookup_in(&scope.data.stage_outputs, path)
    }
}

struct ActivityResolver;

impl Resolver for ActivityResolver {
    fn resolve(&self, scope: &MappingScope<'_>, path: &[String]) -> Option<Value> {
        lookup_in(scope.activity?, path)
    }
}

struct EnvResolver;

impl Resolver for EnvResolver {
    fn resolve(&self, _scope: &MappingScope<'_>, path: &[String]) -> Option<Value> {
        std::env::var(&path[0]).ok().map(Value::String)
    }
}

/// Named resolvers consulted by binding expressions
#[derive(Clone)]
pub struct CompositeResolver {
    resolvers: HashMap<String, Arc<dyn Resolver>>,
}

impl CompositeResolver {
    /// Resolver with no scopes registered
    pub fn empty() -> Self {
        Self {
            resolvers: HashMap::new(),
        }
    }

    pub fn register(&mut self, scope: impl Into<String>, resolver: Arc<dyn Resolver>) {
        self.resolvers.insert(scope.into(), resolver);
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.resolvers.contains_key(scope)
    }

    pub fn resolve(&self, reference: &Reference, scope: &MappingScope<'_>) -> Option<Value> {
        self.resolvers
            .get(&reference.scope)
            .and_then(|resolver| resolver.resolve(scope, &reference.path))
    }
}

impl Default for CompositeResolver {
    fn default() -> Self {
        let mut resolver = Self::empty();
        resolver.register(PIPELINE_SCOPE, Arc::new(PipelineResolver));
        resolver.register(STAGE_SCOPE, Arc::new(StageResolver));
        resolver.register(ACTIVITY_SCOPE, Arc::new(ActivityResolver));
        resolver.register(ENV_SCOPE, Arc::new(EnvResolver));
        resolver
    }
}

impl std::fmt::Debug for CompositeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut scopes: Vec<&String> = self.resolvers.keys().collect();
        scopes.sort();
        f.debug_struct("CompositeResolver").field("scopes", &scopes).finish()
    }
}

/// Piece of an interpolated template
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

/// A compiled binding expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(Reference),
    Template(Vec<Segment>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

fn template_regex() -> &'static Regex {
    static TEMPLATE: OnceLock<Regex> = OnceLock::new();
    TEMPLATE.get_or_init(|| Regex::new(r"\$\{\{(.*?)\}\}").expect("template regex is valid"))
}

impl Expr {
    pub fn compile(value: &Value) -> Result<Self, MappingError> {
        match value {
            Value::String(s) => Self::compile_str(s),
            Value::Array(items) => Ok(Expr::Array(
                items.iter().map(Self::compile).collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => Ok(Expr::Object(
                map.iter()
                    .map(|(k, v)| Self::compile(v).map(|expr| (k.clone(), expr)))
                    .collect::<Result<_, _>>()?,
            )),
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    fn compile_str(s: &str) -> Result<Self, MappingError> {
        let regex = template_regex();
        let trimmed = s.trim();

        if let Some(captures) = regex.captures(trimmed) {
            let whole = captures.get(0).map(|m| m.as_str().len()) == Some(trimmed.len());
            if whole {
                return Ok(Expr::Ref(Reference::parse(&captures[1])?));
            }
        } else {
            if s.contains("${{") {
                return Err(MappingError::Syntax {
                    expr: s.to_string(),
                    reason: "unterminated template".to_string(),
                });
            }
            return Ok(Expr::Literal(Value::String(s.to_string())));
        }

        let mut segments = Vec::new();
        let mut last = 0;
        for captures in regex.captures_iter(s) {
            let whole = captures.get(0).expect("capture group 0 always exists");
            if whole.start() > last {
                segments.push(Segment::Text(s[last..whole.start()].to_string()));
            }
            segments.push(Segment::Ref(Reference::parse(&captures[1])?));
            last = whole.end();
        }
        if last < s.len() {
            segments.push(Segment::Text(s[last..].to_string()));
        }

        let dangling = segments
            .iter()
            .any(|segment| matches!(segment, Segment::Text(text) if text.contains("${{")));
        if dangling {
            return Err(MappingError::Syntax {
                expr: s.to_string(),
                reason: "unterminated template".to_string(),
            });
        }
        Ok(Expr::Template(segments))
    }

    /// Every reference in this expression
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'e>(&'e self, refs: &mut Vec<&'e Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(r) => refs.push(r),
            Expr::Template(segments) => {
                refs.extend(segments.iter().filter_map(|s| match s {
                    Segment::Ref(r) => Some(r),
                    Segment::Text(_) => None,
                }));
            }
            Expr::Array(items) => items.iter().for_each(|e| e.collect_references(refs)),
            Expr::Object(fields) => fields.iter().for_each(|(_, e)| e.collect_references(refs)),
        }
    }

    pub fn eval(&self, resolver: &CompositeResolver, scope: &MappingScope<'_>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Ref(r) => resolver.resolve(r, scope).unwrap_or_else(|| {
                debug!("Reference {} resolved to nothing", r);
                Value::Null
            }),
            Expr::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Ref(r) => match resolver.resolve(r, scope) {
                            Some(Value::String(s)) => out.push_str(&s),
                            Some(Value::Null) | None => {}
                            Some(other) => out.push_str(&other.to_string()),
                        },
                    }
                }
                Value::String(out)
            }
            Expr::Array(items) => Value::Array(items.iter().map(|e| e.eval(resolver, scope)).collect()),
            Expr::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), e.eval(resolver, scope)))
                    .collect(),
            ),
        }
    }
}

/// A compiled set of named bindings
#[derive(Debug, Clone)]
pub struct Mapper {
    bindings: Vec<(String, Expr)>,
    resolver: Arc<CompositeResolver>,
}

impl Mapper {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Names this mapper produces, in binding order
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|(name, _)| name.as_str())
    }

    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.bindings.iter().flat_map(|(_, expr)| expr.references())
    }

    pub fn apply(&self, scope: &MappingScope<'_>) -> Map<String, Value> {
        self.bindings
            .iter()
            .map(|(name, expr)| (name.clone(), expr.eval(&self.resolver, scope)))
            .collect()
    }
}

/// Compiles binding maps into mappers
pub trait MapperFactory: Send + Sync {
    fn new_mapper(&self, bindings: &BTreeMap<String, Value>) -> Result<Mapper, MappingError>;
}

/// Mapper factory for the `${{ ... }}` expression syntax
#[derive(Debug, Clone)]
pub struct ExprMapperFactory {
    resolver: Arc<CompositeResolver>,
}

impl ExprMapperFactory {
    pub fn new(resolver: Arc<CompositeResolver>) -> Self {
        Self { resolver }
    }
}

impl Default for ExprMapperFactory {
    fn default() -> Self {
        Self::new(Arc::new(CompositeResolver::default()))
    }
}

impl MapperFactory for ExprMapperFactory {
    fn new_mapper(&self, bindings: &BTreeMap<String, Value>) -> Result<Mapper, MappingError> {
        let mut compiled = Vec::with_capacity(bindings.len());
        for (name, value) in bindings {
            let expr = Expr::compile(value)?;
            for reference in expr.references() {
                if !self.resolver.contains(&reference.scope) {
                    return Err(MappingError::UnknownScope {
                        scope: reference.scope.clone(),
                        expr: reference.to_string(),
                    });
                }
            }
            compiled.push((name.clone(), expr));
        }
        Ok(Mapper {
            bindings: compiled,
            resolver: self.resolver.clone(),
        })
    }
}
