//! Configuration templates.
//!
//! A [`Template`] is parsed once into literal and placeholder segments, so
//! its placeholder set is known before any rendering happens. Rendering is a
//! pure function of the template and a [`Bindings`] map and fails closed:
//! if any placeholder has no binding, nothing is produced and the error
//! names every unresolved placeholder.
//!
//! Placeholder syntax is `{{ NAME }}`; `\{{` renders as a literal `{{`.
//! Writing rendered text to disk lives in [`write`].

pub mod write;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use serde::de::{self, MapAccess, Visitor};

use crate::error::ProvisionError;
use crate::executor::Secrets;
use crate::facts::Facts;
use crate::settings::Settings;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\\{\{|\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}|\{\{")
        .expect("static placeholder regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses `text` into a template named `name`.
    ///
    /// A `{{` that does not open a well-formed placeholder is rejected, so a
    /// typo can never leak into a rendered file as literal braces.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, ProvisionError> {
        let name = name.into();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut last = 0;

        for caps in TOKEN_RE.captures_iter(text) {
            let whole = caps.get(0).expect("capture group 0 always matches");
            literal.push_str(&text[last..whole.start()]);
            last = whole.end();

            if whole.as_str() == "\\{{" {
                literal.push_str("{{");
                continue;
            }
            let Some(placeholder) = caps.get(1) else {
                let line = text[..whole.start()].matches('\n').count() + 1;
                return Err(ProvisionError::Validation(format!(
                    "template '{}' has a malformed placeholder on line {}",
                    name, line
                )));
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(placeholder.as_str().to_string()));
        }

        literal.push_str(&text[last..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { name, segments })
    }

    /// Returns the template name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the set of placeholder names this template references.
    pub fn placeholders(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Renders the template against `bindings`.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::UnresolvedPlaceholder` naming every
    /// placeholder without a binding.
    pub fn render(&self, bindings: &Bindings) -> Result<String, ProvisionError> {
        let unresolved: BTreeSet<&str> = self
            .placeholders()
            .into_iter()
            .filter(|name| bindings.get(name).is_none())
            .collect();
        if !unresolved.is_empty() {
            return Err(ProvisionError::UnresolvedPlaceholder {
                template: self.name.clone(),
                placeholders: unresolved.into_iter().map(str::to_string).collect(),
            });
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    out.push_str(bindings.get(name).unwrap_or_default());
                }
            }
        }
        Ok(out)
    }
}

/// Renders a single string (a step argument, a destination path, a
/// discovery parameter) that may contain placeholders.
pub fn render_str(label: &str, text: &str, bindings: &Bindings) -> Result<String, ProvisionError> {
    Template::parse(label, text)?.render(bindings)
}

/// Returns the placeholders referenced by a single string.
pub fn placeholders_in(label: &str, text: &str) -> Result<BTreeSet<String>, ProvisionError> {
    Ok(Template::parse(label, text)?
        .placeholders()
        .into_iter()
        .map(str::to_string)
        .collect())
}

/// Name → value map used for rendering.
///
/// Also carries the values of secret settings, so whatever renders a command
/// from these bindings can mask them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, String>,
    secrets: Secrets,
}

impl Bindings {
    /// Creates empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every setting and every discovered fact.
    pub fn from_settings_and_facts(settings: &Settings, facts: &Facts) -> Self {
        let mut bindings = Self::new();
        for (key, value) in settings.iter() {
            bindings.insert(key, value);
        }
        for (key, value) in facts.iter() {
            bindings.insert(key, value);
        }
        bindings.secrets = settings.secrets();
        bindings
    }

    /// Adds or replaces a binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Returns the value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Values that must be masked wherever rendered text is shown.
    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            secrets: Secrets::default(),
        }
    }
}

/// Where a template's text comes from.
///
/// Represents exactly one of `file` (external file) or `content` (inline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// External template file path
    File(Utf8PathBuf),
    /// Inline template text
    Content(String),
}

/// A named template declared in the manifest.
///
/// Deserialization validates that exactly one of `file` or `content` is
/// specified, rejecting YAML that provides both or neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDefinition {
    pub name: String,
    pub source: TemplateSource,
}

impl<'de> Deserialize<'de> for TemplateDefinition {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "lowercase")]
        enum Field {
            Name,
            File,
            Content,
        }

        struct TemplateVisitor;

        impl<'de> Visitor<'de> for TemplateVisitor {
            type Value = TemplateDefinition;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a template with a name and either 'file' or 'content'")
            }

            fn visit_map<V>(self, mut map: V) -> std::result::Result<TemplateDefinition, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut name: Option<String> = None;
                let mut file: Option<Utf8PathBuf> = None;
                let mut content: Option<String> = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Name => {
                            if name.is_some() {
                                return Err(de::Error::duplicate_field("name"));
                            }
                            name = Some(map.next_value()?);
                        }
                        Field::File => {
                            if file.is_some() {
                                return Err(de::Error::duplicate_field("file"));
                            }
                            file = Some(map.next_value()?);
                        }
                        Field::Content => {
                            if content.is_some() {
                                return Err(de::Error::duplicate_field("content"));
                            }
                            content = Some(map.next_value()?);
                        }
                    }
                }

                let name = name.ok_or_else(|| de::Error::missing_field("name"))?;
                let source = match (file, content) {
                    (Some(_), Some(_)) => {
                        return Err(de::Error::custom("'file' and 'content' are mutually exclusive"));
                    }
                    (None, None) => {
                        return Err(de::Error::custom(
                            "either 'file' or 'content' must be specified",
                        ));
                    }
                    (Some(f), None) => TemplateSource::File(f),
                    (None, Some(c)) => TemplateSource::Content(c),
                };

                Ok(TemplateDefinition { name, source })
            }
        }

        const FIELDS: &[&str] = &["name", "file", "content"];
        deserializer.deserialize_struct("TemplateDefinition", FIELDS, TemplateVisitor)
    }
}

impl TemplateDefinition {
    /// Creates an inline template definition.
    pub fn inline(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: TemplateSource::Content(content.into()),
        }
    }

    /// Resolves a relative template file path against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        if let TemplateSource::File(path) = &mut self.source
            && path.is_relative()
        {
            *path = base_dir.join(&*path);
        }
    }

    /// Reads (if external) and parses the template.
    pub fn load(&self) -> Result<Template, ProvisionError> {
        match &self.source {
            TemplateSource::File(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    ProvisionError::io(format!("failed to read template '{}': {}", self.name, path), e)
                })?;
                Template::parse(&self.name, &text)
            }
            TemplateSource::Content(content) => Template::parse(&self.name, content),
        }
    }
}

/// Loaded templates, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet(BTreeMap<String, Template>);

impl TemplateSet {
    /// Loads and parses every definition.
    pub fn load(definitions: &[TemplateDefinition]) -> Result<Self, ProvisionError> {
        let mut set = BTreeMap::new();
        for definition in definitions {
            set.insert(definition.name.clone(), definition.load()?);
        }
        Ok(Self(set))
    }

    /// Returns the template named `name`.
    pub fn get(&self, name: &str) -> Option<&Template> {
        self.0.get(name)
    }
}

impl FromIterator<Template> for TemplateSet {
    fn from_iter<I: IntoIterator<Item = Template>>(iter: I) -> Self {
        Self(iter.into_iter().map(|t| (t.name.clone(), t)).collect())
    }
}
