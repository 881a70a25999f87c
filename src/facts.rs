//! Runtime fact discovery.
//!
//! Facts are values that depend on the host rather than on the operator:
//! an installed daemon's version, the versioned directory its configuration
//! lives in, and so on. Each fact names a [`Discovery`] method; facts are
//! probed once, in declaration order, before any step runs, and later facts
//! may use earlier ones (and any setting) as placeholders in their
//! parameters.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use strum::Display;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::settings::Settings;
use crate::template::{Bindings, placeholders_in, render_str};

fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    1
}

/// Kind of directory entry a [`Discovery::Search`] accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
    #[default]
    Any,
}

impl EntryKind {
    fn accepts(&self, path: &Utf8Path) -> bool {
        match self {
            Self::Dir => path.is_dir(),
            Self::File => path.is_file(),
            Self::Any => true,
        }
    }
}

/// How a fact's value is discovered.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Discovery {
    /// Run a command and take its output.
    ///
    /// The value is the first non-empty trimmed line of stdout, or the first
    /// capture group (whole match if the regex has no group) of `pattern`.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        pattern: Option<String>,
    },
    /// Walk a directory tree and take the lexically first matching entry.
    Search {
        root: String,
        pattern: String,
        #[serde(default)]
        kind: EntryKind,
        #[serde(default = "default_max_depth")]
        max_depth: usize,
    },
    /// Take the first candidate path that exists.
    Path { paths: Vec<String> },
    /// Take the first nested discovery that succeeds.
    FirstOf { candidates: Vec<Discovery> },
}

impl Discovery {
    /// Describes the search for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Command {
                command,
                args,
                pattern,
            } => {
                let mut line = command.clone();
                for arg in args {
                    line.push(' ');
                    line.push_str(arg);
                }
                match pattern {
                    Some(p) => format!("output of `{}` matching '{}'", line, p),
                    None => format!("output of `{}`", line),
                }
            }
            Self::Search {
                root,
                pattern,
                kind,
                max_depth,
            } => format!(
                "entries ({}) under {} within depth {} matching '{}'",
                kind, root, max_depth, pattern
            ),
            Self::Path { paths } => format!("first existing path of [{}]", paths.join(", ")),
            Self::FirstOf { candidates } => format!(
                "first success of [{}]",
                candidates
                    .iter()
                    .map(Self::describe)
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
        }
    }

    /// Returns every placeholder used by this discovery's parameters.
    pub fn placeholders(&self) -> Result<Vec<String>, ProvisionError> {
        let texts: Vec<&String> = match self {
            Self::Command { command, args, .. } => std::iter::once(command).chain(args).collect(),
            Self::Search { root, .. } => vec![root],
            Self::Path { paths } => paths.iter().collect(),
            Self::FirstOf { candidates } => {
                let mut names = Vec::new();
                for candidate in candidates {
                    names.extend(candidate.placeholders()?);
                }
                return Ok(names);
            }
        };
        let mut names = Vec::new();
        for text in texts {
            names.extend(placeholders_in("fact parameter", text)?);
        }
        Ok(names)
    }

    /// Checks that every regex compiles and every list is non-empty.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        match self {
            Self::Command {
                command, pattern, ..
            } => {
                if command.trim().is_empty() {
                    return Err(ProvisionError::Validation(
                        "command discovery requires a command".to_string(),
                    ));
                }
                if let Some(pattern) = pattern {
                    compile(pattern)?;
                }
            }
            Self::Search { pattern, .. } => {
                compile(pattern)?;
            }
            Self::Path { paths } => {
                if paths.is_empty() {
                    return Err(ProvisionError::Validation(
                        "path discovery requires at least one candidate".to_string(),
                    ));
                }
            }
            Self::FirstOf { candidates } => {
                if candidates.is_empty() {
                    return Err(ProvisionError::Validation(
                        "first_of discovery requires at least one candidate".to_string(),
                    ));
                }
                for candidate in candidates {
                    candidate.validate()?;
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn compile(pattern: &str) -> Result<Regex, ProvisionError> {
    Regex::new(pattern)
        .map_err(|e| ProvisionError::Validation(format!("invalid pattern '{}': {}", pattern, e)))
}

/// A fact declared in the manifest.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FactDefinition {
    pub name: String,
    /// Abort the run if the fact cannot be discovered (default: true).
    #[serde(default = "default_true")]
    pub required: bool,
    pub discover: Discovery,
    /// Per-command timeout in seconds for command discoveries.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// A discovered fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub name: String,
    pub value: String,
}

/// All facts discovered during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facts(BTreeMap<String, String>);

impl Facts {
    /// Returns the value of fact `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterates over facts in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of discovered facts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no fact was discovered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, fact: Fact) {
        self.0.insert(fact.name, fact.value);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Facts {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Probes facts using a command executor.
pub struct FactProber {
    executor: Arc<dyn CommandExecutor>,
}

impl FactProber {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Discovers a single fact.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::FactNotFound` naming the search if discovery
    /// yields no value, or a `Validation`/`UnresolvedPlaceholder` error if
    /// the discovery parameters are unusable.
    pub fn probe(
        &self,
        name: &str,
        discovery: &Discovery,
        bindings: &Bindings,
        timeout: Option<Duration>,
    ) -> Result<Fact, ProvisionError> {
        let mut failures = Vec::new();
        match self.discover(discovery, bindings, timeout, &mut failures)? {
            Some(value) => Ok(Fact {
                name: name.to_string(),
                value,
            }),
            None => {
                let mut search = discovery.describe();
                if !failures.is_empty() {
                    search = format!("{} ({})", search, failures.join("; "));
                }
                Err(ProvisionError::FactNotFound {
                    fact: name.to_string(),
                    search,
                })
            }
        }
    }

    /// Probes every fact in declaration order.
    ///
    /// Required facts that are not found abort immediately; optional ones
    /// are logged and left unbound.
    pub fn probe_all(
        &self,
        definitions: &[FactDefinition],
        settings: &Settings,
    ) -> Result<Facts, ProvisionError> {
        let mut facts = Facts::default();
        for definition in definitions {
            let bindings = Bindings::from_settings_and_facts(settings, &facts);
            let timeout = definition.timeout.map(Duration::from_secs);
            match self.probe(&definition.name, &definition.discover, &bindings, timeout) {
                Ok(fact) => {
                    info!("fact {} = {}", fact.name, bindings.secrets().redact(&fact.value));
                    facts.insert(fact);
                }
                Err(ProvisionError::FactNotFound { fact, search }) if !definition.required => {
                    warn!("optional fact {} not found: {}", fact, search);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(facts)
    }

    /// Runs one discovery. Commands that could not run or exited non-zero
    /// are recorded in `failures` so a not-found error can quote them.
    fn discover(
        &self,
        discovery: &Discovery,
        bindings: &Bindings,
        timeout: Option<Duration>,
        failures: &mut Vec<String>,
    ) -> Result<Option<String>, ProvisionError> {
        match discovery {
            Discovery::Command {
                command,
                args,
                pattern,
            } => {
                let command = render_str("fact command", command, bindings)?;
                let args = args
                    .iter()
                    .map(|a| render_str("fact argument", a, bindings))
                    .collect::<Result<Vec<_>, _>>()?;
                let pattern = pattern.as_deref().map(compile).transpose()?;
                let spec = CommandSpec::query(command, args)
                    .with_timeout(timeout)
                    .with_secrets(bindings.secrets().clone());
                self.discover_command(&spec, pattern.as_ref(), failures)
            }
            Discovery::Search {
                root,
                pattern,
                kind,
                max_depth,
            } => {
                let root = Utf8PathBuf::from(render_str("search root", root, bindings)?);
                let pattern = compile(pattern)?;
                let mut matches = Vec::new();
                search_tree(&root, &pattern, *kind, *max_depth, &mut matches);
                matches.sort();
                debug!("search under {} found {} match(es)", root, matches.len());
                Ok(matches.into_iter().next().map(Utf8PathBuf::into_string))
            }
            Discovery::Path { paths } => {
                for candidate in paths {
                    let candidate = render_str("candidate path", candidate, bindings)?;
                    if Utf8Path::new(&candidate).exists() {
                        return Ok(Some(candidate));
                    }
                    debug!("candidate path {} does not exist", candidate);
                }
                Ok(None)
            }
            Discovery::FirstOf { candidates } => {
                for candidate in candidates {
                    if let Some(value) = self.discover(candidate, bindings, timeout, failures)? {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
        }
    }

    fn discover_command(
        &self,
        spec: &CommandSpec,
        pattern: Option<&Regex>,
        failures: &mut Vec<String>,
    ) -> Result<Option<String>, ProvisionError> {
        let result = match self.executor.execute(spec) {
            Ok(result) => result,
            Err(e) => {
                let failure = spec.redact(&format!("{:#}", e));
                debug!("discovery command {} failed: {}", spec.display(), failure);
                failures.push(failure);
                return Ok(None);
            }
        };
        if !result.confirmed_success() {
            let status = result
                .status
                .map_or_else(|| "no exit status".to_string(), |s| s.to_string());
            let mut failure = format!("{} failed with {}", spec.display(), status);
            if let Some(line) = result.stderr.lines().map(str::trim).rfind(|l| !l.is_empty()) {
                failure.push_str(": ");
                failure.push_str(&spec.redact(line));
            }
            debug!("discovery command {}", failure);
            failures.push(failure);
            return Ok(None);
        }

        let value = match pattern {
            Some(re) => re.captures(&result.stdout).and_then(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().trim().to_string())
            }),
            None => result
                .stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
        };
        Ok(value.filter(|v| !v.is_empty()))
    }
}

fn search_tree(
    dir: &Utf8Path,
    pattern: &Regex,
    kind: EntryKind,
    depth_left: usize,
    matches: &mut Vec<Utf8PathBuf>,
) {
    if depth_left == 0 {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("cannot read {}: {}", dir, e);
            return;
        }
    };
    for entry in entries.flatten() {
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if let Some(name) = path.file_name()
            && pattern.is_match(name)
            && kind.accepts(&path)
        {
            matches.push(path.clone());
        }
        if path.is_dir() && !path.is_symlink() {
            search_tree(&path, pattern, kind, depth_left - 1, matches);
        }
    }
}
