//! Manifest loading and static validation.
//!
//! A manifest is a YAML document naming the settings schema, the facts to
//! probe, the templates, the ordered steps and the final service states.
//! Relative paths inside it are resolved against the manifest's directory.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::debug;

use crate::error::ProvisionError;
use crate::facts::FactDefinition;
use crate::package::PackageManager;
use crate::service::ServiceDefinition;
use crate::settings::SettingsConfig;
use crate::step::{Step, StepAction};
use crate::template::TemplateDefinition;

/// A provisioning manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Directory containing the manifest; relative paths resolve against it.
    #[serde(skip)]
    pub dir: Utf8PathBuf,
    #[serde(default)]
    pub package_manager: PackageManager,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub facts: Vec<FactDefinition>,
    #[serde(default)]
    pub templates: Vec<TemplateDefinition>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

/// Loads a manifest and resolves its relative paths.
pub fn load_profile(path: &Utf8Path) -> Result<Profile> {
    let file = File::open(path)
        .map_err(|e| ProvisionError::io(format!("failed to load file: {}", path), e))?;
    let reader = BufReader::new(file);
    let mut profile: Profile = serde_yaml::from_reader(reader)
        .map_err(|e| ProvisionError::Config(format!("failed to parse yaml {}: {}", path, e)))?;

    let dir = match path.parent() {
        Some(p) if !p.as_str().is_empty() => p.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    profile.resolve_paths(&dir);
    profile.dir = dir;
    debug!("loaded manifest {} ({} step(s))", path, profile.steps.len());
    Ok(profile)
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), ProvisionError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(ProvisionError::Validation(format!("{} name must not be empty", kind)));
        }
        if !seen.insert(name) {
            return Err(ProvisionError::Validation(format!(
                "{} '{}' is declared more than once",
                kind, name
            )));
        }
    }
    Ok(())
}

impl Profile {
    fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        self.settings.resolve_paths(base_dir);
        for template in &mut self.templates {
            template.resolve_paths(base_dir);
        }
        for step in &mut self.steps {
            step.resolve_paths(base_dir);
        }
    }

    /// Checks the manifest without touching the host.
    ///
    /// Every placeholder must name a declared setting or a fact; a fact may
    /// only use facts declared before it.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        self.settings.validate()?;
        check_unique("fact", self.facts.iter().map(|f| f.name.as_str()))?;
        check_unique("template", self.templates.iter().map(|t| t.name.as_str()))?;
        check_unique("step", self.steps.iter().map(|s| s.name.as_str()))?;
        check_unique("service", self.services.iter().map(|s| s.name.as_str()))?;

        let mut known: BTreeSet<&str> =
            self.settings.schema.iter().map(|s| s.name.as_str()).collect();

        for fact in &self.facts {
            if self.settings.declares(&fact.name) {
                return Err(ProvisionError::Validation(format!(
                    "fact '{}' has the same name as a setting",
                    fact.name
                )));
            }
            fact.discover.validate().map_err(|e| within("fact", &fact.name, e))?;
            let used = fact.discover.placeholders().map_err(|e| within("fact", &fact.name, e))?;
            check_bound("fact", &fact.name, used.iter().map(String::as_str), &known)?;
            known.insert(fact.name.as_str());
        }

        for definition in &self.templates {
            let template = definition.load()?;
            check_bound("template", &definition.name, template.placeholders().into_iter(), &known)?;
        }

        for step in &self.steps {
            step.validate()?;
            if let StepAction::Template(action) = &step.action
                && !self.templates.iter().any(|t| t.name == action.template)
            {
                return Err(ProvisionError::Validation(format!(
                    "step '{}' references unknown template '{}'",
                    step.name, action.template
                )));
            }
            let used = step.placeholders().map_err(|e| within("step", &step.name, e))?;
            check_bound("step", &step.name, used.iter().map(String::as_str), &known)?;
        }

        for service in &self.services {
            service.validate()?;
        }
        Ok(())
    }
}

fn within(kind: &str, name: &str, e: ProvisionError) -> ProvisionError {
    match e {
        ProvisionError::Validation(msg) => {
            ProvisionError::Validation(format!("{} '{}': {}", kind, name, msg))
        }
        other => other,
    }
}

fn check_bound<'a>(
    kind: &str,
    name: &str,
    used: impl Iterator<Item = &'a str>,
    known: &BTreeSet<&str>,
) -> Result<(), ProvisionError> {
    let unknown: BTreeSet<&str> = used.filter(|p| !known.contains(*p)).collect();
    if unknown.is_empty() {
        return Ok(());
    }
    Err(ProvisionError::Validation(format!(
        "{} '{}' uses undeclared placeholder(s): {}",
        kind,
        name,
        unknown.into_iter().collect::<Vec<_>>().join(", ")
    )))
}

/// Loads and validates a manifest.
pub fn load_and_validate(path: &Utf8Path) -> Result<Profile> {
    let profile = load_profile(path).with_context(|| format!("failed to load manifest {}", path))?;
    profile.validate().context("manifest validation failed")?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Profile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_fact_may_use_earlier_fact_only() {
        let ok = parse(
            r#"
facts:
  - name: FR_VERSION
    discover: { type: command, command: freeradius, args: ["-v"] }
  - name: FR_DIR
    discover: { type: path, paths: ["/etc/freeradius/{{ FR_VERSION }}"] }
"#,
        );
        assert!(ok.validate().is_ok());

        let bad = parse(
            r#"
facts:
  - name: FR_DIR
    discover: { type: path, paths: ["/etc/freeradius/{{ FR_VERSION }}"] }
  - name: FR_VERSION
    discover: { type: command, command: freeradius, args: ["-v"] }
"#,
        );
        let err = bad.validate().unwrap_err().to_string();
        assert!(err.contains("fact 'FR_DIR'"), "got: {}", err);
        assert!(err.contains("FR_VERSION"), "got: {}", err);
    }

    #[test]
    fn test_duplicate_step_names_are_rejected() {
        let profile = parse(
            r#"
steps:
  - { name: a, type: command, command: "true" }
  - { name: a, type: command, command: "true" }
"#,
        );
        let err = profile.validate().unwrap_err().to_string();
        assert!(err.contains("declared more than once"), "got: {}", err);
    }

    #[test]
    fn test_unknown_top_level_key_is_rejected() {
        let result: Result<Profile, _> = serde_yaml::from_str("stepz: []\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_template_step_must_reference_declared_template() {
        let profile = parse(
            r#"
steps:
  - { name: write, type: template, template: missing, dest: /tmp/x }
"#,
        );
        let err = profile.validate().unwrap_err().to_string();
        assert!(err.contains("unknown template 'missing'"), "got: {}", err);
    }
}
