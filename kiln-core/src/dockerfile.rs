//! Dockerfile introspection.
//!
//! The worker only needs enough of a parse to identify the base image of
//! the first stage: leading `ARG` declarations are collected for
//! variable substitution, the first `FROM` is resolved, and everything
//! after it is ignored. Handles line continuations, comments and
//! `--platform`/`AS` decorations.

use crate::error::{KilnError, Result};
use std::collections::HashMap;
use std::path::Path;

/// The parsed identity of a build's base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerfileMetadata {
    pub base_image: String,
    /// Explicit tag, or `latest` when the FROM line has none.
    pub base_image_tag: String,
}

impl DockerfileMetadata {
    /// Parses the Dockerfile at `dockerfile_path` inside the build
    /// context directory.
    pub fn from_dir(context_dir: &Path, dockerfile_path: &str) -> Result<Self> {
        let path = context_dir.join(dockerfile_path);
        let content = std::fs::read_to_string(&path).map_err(|_| KilnError::InvalidDockerfile {
            reason: "Missing Dockerfile".to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parses Dockerfile content.
    pub fn parse(content: &str) -> Result<Self> {
        let lines = preprocess(content);
        if lines.is_empty() {
            return Err(KilnError::InvalidDockerfile { reason: "Empty Dockerfile".to_string() });
        }

        let first = instruction_word(&lines[0]);
        if !first.eq_ignore_ascii_case("FROM") && !first.eq_ignore_ascii_case("ARG") {
            return Err(KilnError::InvalidDockerfile {
                reason: "First line in Dockerfile isn't FROM or ARG".to_string(),
            });
        }

        // Collect leading ARG K=V pairs; they substitute into the first
        // FROM argument.
        let mut substitutions = HashMap::new();
        let mut from_line = None;
        for line in &lines {
            let word = instruction_word(line);
            if word.eq_ignore_ascii_case("ARG") {
                if let Some((key, value)) = parse_arg(line) {
                    substitutions.insert(key, value);
                }
            } else if word.eq_ignore_ascii_case("FROM") {
                from_line = Some(line.as_str());
                break;
            } else {
                break;
            }
        }

        let Some(from_line) = from_line else {
            return Err(KilnError::InvalidDockerfile {
                reason: "Could not parse Dockerfile".to_string(),
            });
        };

        let image_and_tag = from_image_argument(from_line).ok_or_else(invalid_base_image)?;
        let image_and_tag = substitute(&image_and_tag, &substitutions);

        let (base_image, tag) =
            parse_image_reference(&image_and_tag).ok_or_else(invalid_base_image)?;

        Ok(Self {
            base_image,
            base_image_tag: tag.unwrap_or_else(|| "latest".to_string()),
        })
    }
}

fn invalid_base_image() -> KilnError {
    KilnError::InvalidDockerfile {
        reason: "FROM line specifies an invalid base image".to_string(),
    }
}

/// Joins continuation lines and strips comments and blanks.
fn preprocess(content: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut continuation = false;

    for line in content.lines() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };

        let trimmed = line.trim_end();
        if trimmed.is_empty() && !continuation {
            continue;
        }

        if continuation {
            current.push(' ');
            current.push_str(trimmed.trim_end_matches('\\').trim());
        } else {
            current = trimmed.trim_end_matches('\\').trim().to_string();
        }

        continuation = trimmed.ends_with('\\');
        if !continuation && !current.is_empty() {
            result.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        result.push(current);
    }

    result
}

fn instruction_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Extracts `(name, value)` from an `ARG NAME=value` line. Bare `ARG
/// NAME` declarations carry no value and do not participate in
/// substitution.
fn parse_arg(line: &str) -> Option<(String, String)> {
    let mut parts = line.splitn(2, char::is_whitespace);
    parts.next();
    let arg = parts.next()?.trim();
    let (name, value) = arg.split_once('=')?;
    Some((name.to_string(), value.trim_matches('"').to_string()))
}

/// Pulls the image argument out of a FROM line, skipping `--platform=`
/// flags and the trailing `AS name` clause.
fn from_image_argument(line: &str) -> Option<String> {
    line.split_whitespace()
        .skip(1)
        .find(|token| !token.starts_with("--"))
        .map(str::to_string)
}

/// Shell-style `$VAR` / `${VAR}` substitution. Unknown variables expand
/// to the empty string.
fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if name.is_empty() {
            out.push('$');
        } else if let Some(value) = vars.get(&name) {
            out.push_str(value);
        }
    }

    out
}

/// Splits an image reference into `(name, tag)`, validating the name.
/// Digests are accepted and discarded; a `:` inside the first component
/// is a registry port, not a tag separator.
fn parse_image_reference(reference: &str) -> Option<(String, Option<String>)> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }

    let name_and_tag = match reference.split_once('@') {
        Some((name, digest)) if !digest.is_empty() => name,
        Some(_) => return None,
        None => reference,
    };

    let last_slash = name_and_tag.rfind('/');
    let (name, tag) = match name_and_tag.rfind(':') {
        Some(idx) if last_slash.map_or(true, |slash| idx > slash) => {
            let (name, tag) = name_and_tag.split_at(idx);
            (name, Some(tag[1..].to_string()))
        }
        _ => (name_and_tag, None),
    };

    if name.is_empty() || !valid_image_name(name) {
        return None;
    }
    if let Some(tag) = &tag {
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
            return None;
        }
    }

    Some((name.to_string(), tag))
}

fn valid_image_name(name: &str) -> bool {
    name.split('/').enumerate().all(|(i, component)| {
        if component.is_empty() {
            return false;
        }
        // The first component may be a registry host with a port.
        let extra = if i == 0 { ".:-_" } else { ".-_" };
        component.chars().all(|c| c.is_ascii_alphanumeric() || extra.contains(c))
            && !component.starts_with(['.', '-'])
            && !component.ends_with(['.', '-'])
    })
}
