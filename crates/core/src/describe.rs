//! Description resolver: parses the algorithm composition grammar into a
//! closed node tree and builds runnable object graphs from it
//!
//! Operators, loosest binding first: `!` (chain), `+` (pipe), `/` (fork);
//! `{...}` wraps in a caching decorator, `<...>` in a persistence decorator,
//! `(...)` overrides precedence. The base case is `Name(arg, key=value, ...)`
//! resolved through the registries. All failures here are fatal
//! configuration errors raised before any data flows.

use crate::composite::{Cache, Chain, Fork, Independent, LoadStore, Pipe};
use crate::context::Context;
use crate::distance::Distance;
use crate::transform::Transform;
use template_pipeline_common::{split_outside_brackets, ConfigError};
use tracing::debug;

/// Guard against abbreviation cycles.
const MAX_SUBSTITUTIONS: usize = 32;

/// The closed set of composition nodes a description resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptionNode {
    Leaf { name: String, args: Vec<String> },
    Pipe(Vec<DescriptionNode>),
    Fork(Vec<DescriptionNode>),
    Chain(Vec<DescriptionNode>),
    Cache(Box<DescriptionNode>),
    LoadStore(Box<DescriptionNode>),
}

/// Parse a description string into its composition tree.
pub fn parse(description: &str, ctx: &Context) -> Result<DescriptionNode, ConfigError> {
    parse_inner(description, ctx, 0)
}

fn parse_inner(
    description: &str,
    ctx: &Context,
    substitutions: usize,
) -> Result<DescriptionNode, ConfigError> {
    let description = description.trim();
    if description.is_empty() {
        return Err(malformed(description, "empty description"));
    }

    // Whole-string aliases substitute and restart resolution.
    if let Some(expansion) = ctx.abbreviations.get(description) {
        if substitutions >= MAX_SUBSTITUTIONS {
            return Err(malformed(description, "abbreviation cycle"));
        }
        debug!(alias = description, expansion = %expansion, "substituting abbreviation");
        return parse_inner(expansion, ctx, substitutions + 1);
    }

    check_balance(description)?;

    for (separator, composite) in [
        ('!', DescriptionNode::Chain as fn(Vec<DescriptionNode>) -> DescriptionNode),
        ('+', DescriptionNode::Pipe),
        ('/', DescriptionNode::Fork),
    ] {
        let parts = split_outside_brackets(description, separator);
        if parts.len() > 1 {
            let mut children = Vec::with_capacity(parts.len());
            for part in &parts {
                if part.trim().is_empty() {
                    return Err(malformed(description, "empty operand"));
                }
                children.push(parse_inner(part, ctx, substitutions)?);
            }
            return Ok(composite(children));
        }
    }

    if wraps(description, '{', '}') {
        let inner = &description[1..description.len() - 1];
        return Ok(DescriptionNode::Cache(Box::new(parse_inner(
            inner,
            ctx,
            substitutions,
        )?)));
    }

    if wraps(description, '<', '>') {
        let inner = &description[1..description.len() - 1];
        return Ok(DescriptionNode::LoadStore(Box::new(parse_inner(
            inner,
            ctx,
            substitutions,
        )?)));
    }

    // Grouping strips one paren level and re-resolves; no wrapper object.
    if wraps(description, '(', ')') {
        return parse_inner(&description[1..description.len() - 1], ctx, substitutions);
    }

    parse_leaf(description)
}

fn parse_leaf(description: &str) -> Result<DescriptionNode, ConfigError> {
    match description.find('(') {
        None => {
            if description.contains(')') {
                return Err(malformed(description, "unexpected `)`"));
            }
            Ok(DescriptionNode::Leaf {
                name: description.to_string(),
                args: Vec::new(),
            })
        }
        Some(open) => {
            if !description.ends_with(')') {
                return Err(malformed(description, "expected trailing `)`"));
            }
            let name = description[..open].trim();
            if name.is_empty() {
                return Err(malformed(description, "missing type name"));
            }
            let inner = &description[open + 1..description.len() - 1];
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                split_outside_brackets(inner, ',')
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .collect()
            };
            Ok(DescriptionNode::Leaf {
                name: name.to_string(),
                args,
            })
        }
    }
}

/// Build a transform graph from a parsed node. Base-case transforms that
/// declare themselves independent are wrapped in the Independent adapter.
pub fn build_transform(
    node: &DescriptionNode,
    ctx: &Context,
) -> Result<Box<dyn Transform>, ConfigError> {
    match node {
        DescriptionNode::Leaf { name, args } => {
            let transform = ctx.transforms.make(name, args, ctx)?;
            if transform.independent() {
                Ok(Box::new(Independent::new(transform)))
            } else {
                Ok(transform)
            }
        }
        DescriptionNode::Pipe(children) => {
            Ok(Box::new(Pipe::new(build_children(children, ctx)?)))
        }
        DescriptionNode::Fork(children) => {
            Ok(Box::new(Fork::new(build_children(children, ctx)?)))
        }
        DescriptionNode::Chain(children) => {
            Ok(Box::new(Chain::new(build_children(children, ctx)?)))
        }
        DescriptionNode::Cache(inner) => {
            Ok(Box::new(Cache::new(build_transform(inner, ctx)?)))
        }
        DescriptionNode::LoadStore(inner) => {
            Ok(Box::new(LoadStore::new(build_transform(inner, ctx)?)))
        }
    }
}

fn build_children(
    children: &[DescriptionNode],
    ctx: &Context,
) -> Result<Vec<Box<dyn Transform>>, ConfigError> {
    children.iter().map(|c| build_transform(c, ctx)).collect()
}

/// Resolve a description string to a runnable transform graph.
pub fn transform_from(description: &str, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
    debug!(description, "resolving transform");
    build_transform(&parse(description, ctx)?, ctx)
}

/// Resolve a description string to a distance. Distances support
/// abbreviation substitution and the base case only.
pub fn distance_from(description: &str, ctx: &Context) -> Result<Box<dyn Distance>, ConfigError> {
    let mut description = description.trim();
    let mut substitutions = 0;
    while let Some(expansion) = ctx.abbreviations.get(description) {
        substitutions += 1;
        if substitutions > MAX_SUBSTITUTIONS {
            return Err(malformed(description, "abbreviation cycle"));
        }
        description = expansion.as_str();
    }
    check_balance(description)?;
    match parse_leaf(description)? {
        DescriptionNode::Leaf { name, args } => ctx.distances.make(&name, &args, ctx),
        _ => Err(malformed(description, "expected a distance name")),
    }
}

fn malformed(fragment: &str, reason: &str) -> ConfigError {
    ConfigError::Malformed {
        fragment: fragment.to_string(),
        reason: reason.to_string(),
    }
}

/// Reject unbalanced or mismatched bracket nesting before any splitting.
fn check_balance(description: &str) -> Result<(), ConfigError> {
    let mut stack = Vec::new();
    for ch in description.chars() {
        match ch {
            '(' | '[' | '{' | '<' => stack.push(ch),
            ')' | ']' | '}' | '>' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    '}' => '{',
                    _ => '<',
                };
                if stack.pop() != Some(expected) {
                    return Err(malformed(description, "mismatched brackets"));
                }
            }
            _ => {}
        }
    }
    if stack.is_empty() {
        Ok(())
    } else {
        Err(malformed(description, "unclosed bracket"))
    }
}

/// True when the whole string is one bracketed group: it starts with `open`,
/// ends with `close`, and the opening bracket does not close before the end.
fn wraps(description: &str, open: char, close: char) -> bool {
    if !description.starts_with(open) || !description.ends_with(close) {
        return false;
    }
    let mut depth = 0i32;
    for (i, ch) in description.char_indices() {
        match ch {
            '(' | '[' | '{' | '<' => depth += 1,
            ')' | ']' | '}' | '>' => depth -= 1,
            _ => {}
        }
        if depth == 0 {
            // The opening bracket must close exactly at the final character.
            return i == description.len() - 1;
        }
    }
    false
}
