//! Subject and body templates.
//!
//! Templates use flat `{Key}` placeholders. `{{` and `}}` produce literal
//! braces. Nothing else is interpreted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::types::CampaignBuilder;

/// Values bound to placeholders for one render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVariables {
    values: BTreeMap<String, String>,
}

impl TemplateVariables {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to `value`, replacing any earlier binding.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns the value bound to `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Fills in bindings from `defaults` that are not already set.
    pub fn with_defaults(mut self, defaults: &BTreeMap<String, String>) -> Self {
        for (key, value) in defaults {
            self.values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Returns the number of bindings.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TemplateVariables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parses template text.
    pub fn parse(source: &str) -> MailerResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(MailerError::malformed_template(format!(
                        "unmatched '}}' at byte {}",
                        pos
                    )));
                }
                '{' => {
                    let mut key = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, '{')) | None => {
                                return Err(MailerError::malformed_template(format!(
                                    "unclosed '{{' at byte {}",
                                    pos
                                )));
                            }
                            Some((_, ch)) => key.push(ch),
                        }
                    }
                    if key.is_empty() {
                        return Err(MailerError::malformed_template(format!(
                            "empty placeholder at byte {}",
                            pos
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(key));
                }
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Returns the distinct placeholder keys in order of first use.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(key) = segment {
                if !keys.contains(&key.as_str()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Substitutes every placeholder.
    ///
    /// Fails with `MissingVariable` on the first unbound key.
    pub fn render(&self, variables: &TemplateVariables) -> MailerResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => {
                    let value = variables
                        .get(key)
                        .ok_or_else(|| MailerError::missing_variable(key.as_str()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Parses and renders `template` in one step.
pub fn render(template: &str, variables: &TemplateVariables) -> MailerResult<String> {
    Template::parse(template)?.render(variables)
}

/// A stored subject/body pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEntry {
    /// Subject template.
    pub subject: String,
    /// Body template.
    pub body: String,
}

impl TemplateEntry {
    /// Starts a campaign from this entry.
    pub fn campaign_builder(&self) -> CampaignBuilder {
        CampaignBuilder::default()
            .subject(self.subject.clone())
            .body(self.body.clone())
    }
}

/// Read-only template catalog keyed by category and name.
///
/// The JSON layout is `{"category": {"name": {"subject": .., "body": ..}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateCatalog {
    categories: BTreeMap<String, BTreeMap<String, TemplateEntry>>,
}

impl TemplateCatalog {
    /// Parses a catalog from JSON.
    pub fn from_json_str(json: &str) -> MailerResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            MailerError::validation(
                MailerErrorKind::MalformedTemplate,
                format!("Invalid template catalog: {}", e),
            )
            .with_cause(e)
        })
    }

    /// Reads a catalog file.
    pub fn from_path(path: impl AsRef<Path>) -> MailerResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            MailerError::configuration(format!("Cannot read {}: {}", path.display(), e))
                .with_cause(e)
        })?;
        Self::from_json_str(&json)
    }

    /// Returns category names in sorted order.
    pub fn categories(&self) -> Vec<&str> {
        self.categories.keys().map(String::as_str).collect()
    }

    /// Returns every `(category, name)` pair in sorted order.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        self.categories
            .iter()
            .flat_map(|(category, names)| {
                names.keys().map(move |name| (category.as_str(), name.as_str()))
            })
            .collect()
    }

    /// Looks up one template.
    pub fn get(&self, category: &str, name: &str) -> MailerResult<&TemplateEntry> {
        self.categories
            .get(category)
            .and_then(|names| names.get(name))
            .ok_or_else(|| {
                MailerError::validation(
                    MailerErrorKind::UnknownTemplate,
                    format!("no template {:?} in category {:?}", name, category),
                )
            })
    }
}
