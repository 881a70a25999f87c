//! Settings loading and validation.
//!
//! Settings are flat `KEY=VALUE` pairs read from an env-style file. The
//! manifest declares a schema listing which keys are required and how their
//! values are validated. Loading is fail-closed: every missing, empty or
//! invalid setting is collected into a single
//! [`ProvisionError::MissingConfig`] so the operator sees the whole list at
//! once, and nothing touches the host before the settings are known good.

use std::collections::BTreeMap;
use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use strum::Display;
use tracing::debug;

use crate::error::{ProvisionError, SettingProblem, SettingProblemKind};
use crate::executor::{REDACTED, Secrets};

/// Value check applied to a setting after presence is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Validator {
    /// Value must contain a non-whitespace character.
    NonEmpty,
    /// Value must parse as an unsigned integer.
    Numeric,
    /// Value must name an existing filesystem path.
    PathExists,
    /// Value must parse as an absolute URL.
    Url,
}

impl Validator {
    /// Checks `value`, returning a human-readable reason on failure.
    pub fn check(&self, value: &str) -> Result<(), String> {
        match self {
            Self::NonEmpty => {
                if value.trim().is_empty() {
                    return Err("must not be blank".to_string());
                }
            }
            Self::Numeric => {
                if value.parse::<u64>().is_err() {
                    return Err(format!("not numeric: '{}'", value));
                }
            }
            Self::PathExists => {
                if !Utf8Path::new(value).exists() {
                    return Err(format!("path does not exist: {}", value));
                }
            }
            Self::Url => {
                url::Url::parse(value).map_err(|e| format!("not a valid URL: {}", e))?;
            }
        }
        Ok(())
    }
}

fn default_required() -> bool {
    true
}

/// Declaration of a single setting in the manifest schema.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SettingSpec {
    /// Setting key, e.g. `DB_PASS`.
    pub name: String,
    /// Whether the setting must be present and non-empty (default: true).
    #[serde(default = "default_required")]
    pub required: bool,
    /// Optional value validator.
    #[serde(default)]
    pub validate: Option<Validator>,
    /// Allowed values; empty means any value.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Value used when an optional setting is absent or empty.
    #[serde(default)]
    pub default: Option<String>,
    /// Mask the value in logs.
    #[serde(default)]
    pub secret: bool,
}

impl SettingSpec {
    /// Creates a required setting without validator.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            validate: None,
            allowed: Vec::new(),
            default: None,
            secret: false,
        }
    }

    /// Creates an optional setting without validator.
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    /// Sets the validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validate = Some(validator);
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Masks `value` in `reason` when this setting is secret.
    fn masked(&self, value: &str, reason: String) -> String {
        if self.secret {
            Secrets::new([value]).redact(&reason)
        } else {
            reason
        }
    }

    fn check_value(&self, value: &str) -> Result<(), String> {
        if let Some(validator) = &self.validate {
            validator.check(value)?;
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| a == value) {
            return Err(format!("'{}' is not one of: {}", value, self.allowed.join(", ")));
        }
        Ok(())
    }
}

/// Settings section of the manifest.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SettingsConfig {
    /// Path of the settings file, relative to the manifest directory.
    #[serde(default)]
    pub file: Option<Utf8PathBuf>,
    /// Declared settings.
    #[serde(default)]
    pub schema: Vec<SettingSpec>,
}

impl SettingsConfig {
    /// Returns true if `name` is declared in the schema.
    pub fn declares(&self, name: &str) -> bool {
        self.schema.iter().any(|s| s.name == name)
    }

    /// Resolves a relative settings file path against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        if let Some(path) = &mut self.file
            && path.is_relative()
        {
            *path = base_dir.join(&*path);
        }
    }

    /// Validates the schema itself: keys must be well-formed and unique.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.schema {
            if !is_valid_key(&spec.name) {
                return Err(ProvisionError::Validation(format!(
                    "setting name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ProvisionError::Validation(format!(
                    "setting '{}' is declared more than once",
                    spec.name
                )));
            }
            if spec.required && spec.default.is_some() {
                return Err(ProvisionError::Validation(format!(
                    "setting '{}' is required and cannot have a default",
                    spec.name
                )));
            }
            // path_exists depends on the host, so it is checked when the default is applied.
            if let Some(default) = &spec.default
                && spec.validate != Some(Validator::PathExists)
                && let Err(reason) = spec.check_value(default)
            {
                return Err(ProvisionError::Validation(format!(
                    "setting '{}' has an invalid default: {}",
                    spec.name,
                    spec.masked(default, reason)
                )));
            }
        }
        Ok(())
    }
}

/// Immutable, validated settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
    secrets: Vec<String>,
}

impl Settings {
    /// Returns the value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns true if `key` has a value.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterates over all settings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of settings.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no settings.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns `value` or `"********"` when `key` is declared secret.
    pub fn display_value<'a>(&'a self, key: &str, value: &'a str) -> &'a str {
        if self.secrets.iter().any(|s| s == key) {
            REDACTED
        } else {
            value
        }
    }

    /// Returns the values of every secret setting.
    pub fn secrets(&self) -> Secrets {
        Secrets::new(self.secrets.iter().filter_map(|key| self.get(key)))
    }
}

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static key regex is valid"));

fn is_valid_key(key: &str) -> bool {
    KEY_RE.is_match(key)
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parses env-style `KEY=VALUE` text.
///
/// Blank lines and lines starting with `#` are ignored, a leading `export `
/// is accepted, and matching surrounding quotes are stripped from values.
/// Later occurrences of a key replace earlier ones.
pub fn parse_settings(text: &str) -> Result<BTreeMap<String, String>, ProvisionError> {
    let mut values = BTreeMap::new();

    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(ProvisionError::Config(format!(
                "settings line {} is not KEY=VALUE: {}",
                index + 1,
                raw_line
            )));
        };
        let key = key.trim();
        if !is_valid_key(key) {
            return Err(ProvisionError::Config(format!(
                "settings line {} has an invalid key: '{}'",
                index + 1,
                key
            )));
        }
        if values
            .insert(key.to_string(), unquote(value.trim()).to_string())
            .is_some()
        {
            debug!("setting {} redefined on line {}", key, index + 1);
        }
    }

    Ok(values)
}

/// Parses `KEY=VALUE` overrides given on the command line.
pub fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<String, String>, ProvisionError> {
    parse_settings(&pairs.join("\n"))
        .map_err(|e| ProvisionError::Config(format!("invalid --set override: {}", e)))
}

/// Validates raw key/value pairs against the schema.
///
/// Every problem is collected before returning, so a single
/// `MissingConfig` names all missing, empty and invalid keys.
pub fn validate_settings(
    mut raw: BTreeMap<String, String>,
    schema: &[SettingSpec],
) -> Result<Settings, ProvisionError> {
    let mut problems = Vec::new();

    for spec in schema {
        let present = raw.get(&spec.name).map(String::as_str);
        match present {
            None | Some("") if !spec.required => {
                if let Some(default) = &spec.default {
                    if let Err(reason) = spec.check_value(default) {
                        problems.push(SettingProblem {
                            key: spec.name.clone(),
                            kind: SettingProblemKind::Invalid(format!(
                                "default {}",
                                spec.masked(default, reason)
                            )),
                        });
                    }
                    raw.insert(spec.name.clone(), default.clone());
                } else {
                    raw.remove(&spec.name);
                }
            }
            None => problems.push(SettingProblem {
                key: spec.name.clone(),
                kind: SettingProblemKind::Missing,
            }),
            Some("") => problems.push(SettingProblem {
                key: spec.name.clone(),
                kind: SettingProblemKind::Empty,
            }),
            Some(value) => {
                if let Err(reason) = spec.check_value(value) {
                    problems.push(SettingProblem {
                        key: spec.name.clone(),
                        kind: SettingProblemKind::Invalid(spec.masked(value, reason)),
                    });
                }
            }
        }
    }

    if !problems.is_empty() {
        return Err(ProvisionError::MissingConfig { problems });
    }

    for key in raw.keys() {
        if !schema.iter().any(|s| &s.name == key) {
            debug!("setting {} is not declared in the schema", key);
        }
    }

    Ok(Settings {
        values: raw,
        secrets: schema
            .iter()
            .filter(|s| s.secret)
            .map(|s| s.name.clone())
            .collect(),
    })
}

/// Loads the settings file, applies overrides and validates against the schema.
///
/// When `path` is `None`, only the overrides are used.
pub fn load(
    path: Option<&Utf8Path>,
    schema: &[SettingSpec],
    overrides: BTreeMap<String, String>,
) -> Result<Settings, ProvisionError> {
    let mut raw = match path {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| ProvisionError::io(path.as_str(), e))?;
            parse_settings(&text)?
        }
        None => BTreeMap::new(),
    };
    raw.extend(overrides);

    let settings = validate_settings(raw, schema)?;
    for (key, value) in settings.iter() {
        debug!("setting {}={}", key, settings.display_value(key, value));
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings_handles_comments_quotes_and_export() {
        let text = "# database\nDB_NAME=radius\n  \nexport DB_USER = 'radius'\nDB_PASS=\"s3cr=t\"\n";
        let values = parse_settings(text).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values["DB_NAME"], "radius");
        assert_eq!(values["DB_USER"], "radius");
        assert_eq!(values["DB_PASS"], "s3cr=t");
    }

    #[test]
    fn test_parse_settings_rejects_line_without_equals() {
        let err = parse_settings("DB_NAME=radius\nnot a pair\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "got: {}", err);
    }

    #[test]
    fn test_parse_settings_rejects_invalid_key() {
        let err = parse_settings("1ABC=x").unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_parse_settings_last_definition_wins() {
        let values = parse_settings("A=1\nA=2\n").unwrap();
        assert_eq!(values["A"], "2");
    }

    #[test]
    fn test_unquote_leaves_mismatched_quotes() {
        assert_eq!(unquote("'abc\""), "'abc\"");
        assert_eq!(unquote("\""), "\"");
        assert_eq!(unquote("''"), "");
    }

    #[test]
    fn test_validators() {
        assert!(Validator::NonEmpty.check("x").is_ok());
        assert!(Validator::NonEmpty.check("   ").is_err());
        assert!(Validator::Numeric.check("3306").is_ok());
        assert!(Validator::Numeric.check("-1").is_err());
        assert!(Validator::Numeric.check("abc").is_err());
        assert!(Validator::PathExists.check("/").is_ok());
        assert!(Validator::PathExists.check("/definitely/not/here").is_err());
        assert!(Validator::Url.check("https://radius.example.org/").is_ok());
        assert!(Validator::Url.check("not a url").is_err());
    }

    #[test]
    fn test_optional_setting_uses_default() {
        let schema = vec![SettingSpec::optional("DB_HOST").with_default("localhost")];
        let settings = validate_settings(BTreeMap::new(), &schema).unwrap();
        assert_eq!(settings.get("DB_HOST"), Some("localhost"));
    }

    #[test]
    fn test_optional_empty_setting_without_default_is_absent() {
        let schema = vec![SettingSpec::optional("TZ")];
        let raw = BTreeMap::from([("TZ".to_string(), String::new())]);
        let settings = validate_settings(raw, &schema).unwrap();
        assert!(!settings.contains("TZ"));
    }

    #[test]
    fn test_allowed_values_are_enforced() {
        let mut spec = SettingSpec::required("DB_ENGINE");
        spec.allowed = vec!["mysql".to_string(), "postgresql".to_string()];
        let raw = BTreeMap::from([("DB_ENGINE".to_string(), "sqlite".to_string())]);
        let err = validate_settings(raw, &[spec]).unwrap_err();
        assert!(err.to_string().contains("'sqlite' is not one of: mysql, postgresql"));
    }

    #[test]
    fn test_secret_values_are_masked() {
        let mut spec = SettingSpec::required("DB_PASS");
        spec.secret = true;
        let raw = BTreeMap::from([("DB_PASS".to_string(), "hunter2".to_string())]);
        let settings = validate_settings(raw, &[spec]).unwrap();
        assert_eq!(settings.display_value("DB_PASS", "hunter2"), "********");
        assert_eq!(settings.display_value("OTHER", "x"), "x");
    }

    #[test]
    fn test_schema_validation_rejects_duplicates_and_bad_names() {
        let config = SettingsConfig {
            file: None,
            schema: vec![SettingSpec::required("A"), SettingSpec::required("A")],
        };
        assert!(config.validate().is_err());

        let config = SettingsConfig {
            file: None,
            schema: vec![SettingSpec::required("bad-name")],
        };
        assert!(config.validate().is_err());

        let config = SettingsConfig {
            file: None,
            schema: vec![SettingSpec::required("A").with_default("x")],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schema_validation_rejects_default_outside_its_rules() {
        let config = SettingsConfig {
            file: None,
            schema: vec![
                SettingSpec::optional("RADIUS_PORT")
                    .with_validator(Validator::Numeric)
                    .with_default("eighteen-twelve"),
            ],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RADIUS_PORT"), "got: {}", err);
        assert!(err.to_string().contains("invalid default"), "got: {}", err);

        let mut engine = SettingSpec::optional("DB_ENGINE").with_default("sqlite");
        engine.allowed = vec!["mysql".to_string(), "postgresql".to_string()];
        let config = SettingsConfig {
            file: None,
            schema: vec![engine.clone()],
        };
        assert!(config.validate().is_err());

        engine.default = Some("mysql".to_string());
        let config = SettingsConfig {
            file: None,
            schema: vec![engine],
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_path_default_is_reported_when_applied() {
        let spec = SettingSpec::optional("CERT_DIR")
            .with_validator(Validator::PathExists)
            .with_default("/nonexistent/rsprovision/certs");
        let config = SettingsConfig {
            file: None,
            schema: vec![spec.clone()],
        };
        config.validate().unwrap();

        let err = validate_settings(BTreeMap::new(), &[spec]).unwrap_err();
        assert!(err.to_string().contains("CERT_DIR"), "got: {}", err);
    }

    #[test]
    fn test_invalid_secret_is_not_echoed() {
        let mut spec = SettingSpec::required("DB_PASS").with_validator(Validator::Numeric);
        spec.secret = true;
        let raw = BTreeMap::from([("DB_PASS".to_string(), "hunter2".to_string())]);
        let err = validate_settings(raw, &[spec]).unwrap_err();
        assert!(!err.to_string().contains("hunter2"), "got: {}", err);
        assert!(err.to_string().contains("********"), "got: {}", err);
    }

    #[test]
    fn test_secrets_hold_secret_values_only() {
        let mut pass = SettingSpec::required("DB_PASS");
        pass.secret = true;
        let raw = BTreeMap::from([
            ("DB_PASS".to_string(), "hunter2".to_string()),
            ("DB_USER".to_string(), "radius".to_string()),
        ]);
        let settings = validate_settings(raw, &[pass, SettingSpec::required("DB_USER")]).unwrap();
        assert_eq!(settings.secrets().redact("radius:hunter2"), "radius:********");
    }
}
