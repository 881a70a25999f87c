use std::collections::VecDeque;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rsprovision::cli::{ApplyArgs, CommonArgs, LogLevel, SettingsArgs};
use rsprovision::executor::{CommandExecutor, CommandSpec, ExecutionResult};

/// A scripted reply to a command.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Reply {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[allow(dead_code)]
impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Records every command and answers from a script.
///
/// Rules match on the prefix of the command line (`command arg1 arg2 ...`),
/// first declared rule first. A rule with several replies hands them out in
/// order and then keeps repeating the last. Unmatched commands exit 0 with
/// no output. In dry-run mode non-query commands are recorded but not
/// answered, the way the real executor skips them.
#[derive(Default)]
pub struct MockExecutor {
    calls: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<Option<Duration>>>,
    rules: Mutex<Vec<(String, VecDeque<Reply>)>>,
    dry_run: bool,
}

#[allow(dead_code)]
impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn on(self, prefix: &str, reply: Reply) -> Self {
        self.on_seq(prefix, vec![reply])
    }

    pub fn on_seq(self, prefix: &str, replies: Vec<Reply>) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push((prefix.to_string(), replies.into_iter().collect()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Timeouts of the calls whose command line starts with `prefix`.
    pub fn timeouts_for(&self, prefix: &str) -> Vec<Option<Duration>> {
        let calls = self.calls.lock().unwrap();
        let timeouts = self.timeouts.lock().unwrap();
        calls
            .iter()
            .zip(timeouts.iter())
            .filter(|(call, _)| call.starts_with(prefix))
            .map(|(_, timeout)| *timeout)
            .collect()
    }

    /// Calls whose command line starts with `prefix`.
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

fn command_line(spec: &CommandSpec) -> String {
    let mut line = spec.command.clone();
    for arg in &spec.args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

impl CommandExecutor for MockExecutor {
    fn execute(&self, spec: &CommandSpec) -> anyhow::Result<ExecutionResult> {
        let line = command_line(spec);
        self.calls.lock().unwrap().push(line.clone());
        self.timeouts.lock().unwrap().push(spec.timeout);

        if self.dry_run && !spec.query {
            return Ok(ExecutionResult::dry_run());
        }

        let mut rules = self.rules.lock().unwrap();
        let reply = rules
            .iter_mut()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .and_then(|(_, replies)| {
                if replies.len() > 1 {
                    replies.pop_front()
                } else {
                    replies.front().cloned()
                }
            })
            .unwrap_or_else(|| Reply::ok(""));

        Ok(ExecutionResult {
            status: Some(ExitStatus::from_raw(reply.code << 8)),
            stdout: reply.stdout,
            stderr: reply.stderr,
        })
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Returns the temp dir's path as UTF-8.
#[allow(dead_code)]
pub fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("temp dir should be valid UTF-8")
}

/// Writes `content` to `dir/name`, creating parent directories.
#[allow(dead_code)]
pub fn write_file(dir: &Utf8Path, name: &str, content: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Builds `apply` arguments for a manifest.
#[allow(dead_code)]
pub fn apply_args(file: &Utf8Path, settings: Option<&Utf8Path>, dry_run: bool) -> ApplyArgs {
    ApplyArgs {
        common: CommonArgs {
            file: file.to_path_buf(),
            log_level: LogLevel::Error,
        },
        settings: SettingsArgs {
            settings: settings.map(Utf8Path::to_path_buf),
            overrides: Vec::new(),
        },
        dry_run,
    }
}
