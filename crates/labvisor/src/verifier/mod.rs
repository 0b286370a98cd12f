//! Objective verification.
//!
//! The [`Verifier`] keeps a rolling command history per session, rebuilt
//! from raw terminal input, and evaluates [`VerifyRule`]s against it. Script
//! rules are delegated to a [`ScriptRunner`] that executes inside the lab
//! unit; their exit code decides the outcome.

mod flags;
mod history;

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;

use labvisor_protocol::{VerifyOutcome, VerifyRule};

use crate::backend::ExecOutput;
use crate::terminal::InputTap;

pub use flags::{DEFAULT_FLAG_POINTS, FlagBoard};
pub use history::{CommandHistory, DEFAULT_HISTORY};

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
const DETAIL_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("verification script failed to run: {0}")]
    Script(String),
}

/// Runs a verification script inside a session's unit.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run_script(
        &self,
        session_id: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, VerifyError>;
}

#[derive(Debug)]
pub struct Verifier {
    histories: DashMap<String, CommandHistory>,
    capacity: usize,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl Verifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            histories: DashMap::new(),
            capacity,
        }
    }

    pub fn record(&self, session_id: &str, data: &[u8]) {
        self.histories
            .entry(session_id.to_string())
            .or_insert_with(|| CommandHistory::new(self.capacity))
            .feed(data);
    }

    /// Recorded commands, oldest first.
    pub fn commands(&self, session_id: &str) -> Vec<String> {
        self.histories
            .get(session_id)
            .map(|h| h.commands().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, session_id: &str) {
        self.histories.remove(session_id);
    }

    pub async fn verify(
        &self,
        session_id: &str,
        rule: &VerifyRule,
        runner: &dyn ScriptRunner,
    ) -> Result<VerifyOutcome, VerifyError> {
        match rule {
            VerifyRule::Regex { pattern } => {
                let re = compile(pattern)?;
                let matched = self.matching(session_id, &re);
                Ok(VerifyOutcome {
                    passed: !matched.is_empty(),
                    matched,
                    detail: None,
                })
            }
            VerifyRule::AllOf { patterns } => {
                let (matched, missing) = self.match_each(session_id, patterns)?;
                let detail = (!missing.is_empty())
                    .then(|| format!("not yet seen: {}", missing.join(", ")));
                Ok(VerifyOutcome {
                    passed: !patterns.is_empty() && missing.is_empty(),
                    matched,
                    detail,
                })
            }
            VerifyRule::AnyOf { patterns } => {
                let (matched, missing) = self.match_each(session_id, patterns)?;
                Ok(VerifyOutcome {
                    passed: missing.len() < patterns.len(),
                    matched,
                    detail: None,
                })
            }
            VerifyRule::Script {
                script,
                timeout_secs,
            } => {
                let timeout = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_SCRIPT_TIMEOUT);
                let output = runner.run_script(session_id, script, timeout).await?;
                let text = if output.stdout.trim().is_empty() {
                    output.stderr.trim()
                } else {
                    output.stdout.trim()
                };
                Ok(VerifyOutcome {
                    passed: output.success(),
                    matched: Vec::new(),
                    detail: (!text.is_empty()).then(|| truncate(text, DETAIL_LIMIT)),
                })
            }
        }
    }

    fn matching(&self, session_id: &str, re: &Regex) -> Vec<String> {
        self.histories
            .get(session_id)
            .map(|h| {
                h.commands()
                    .filter(|c| re.is_match(c))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Commands matched by any pattern (deduplicated, history order) and the
    /// patterns that matched nothing.
    fn match_each(
        &self,
        session_id: &str,
        patterns: &[String],
    ) -> Result<(Vec<String>, Vec<String>), VerifyError> {
        let compiled = patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let commands = self.commands(session_id);

        let missing = patterns
            .iter()
            .zip(&compiled)
            .filter(|(_, re)| !commands.iter().any(|c| re.is_match(c)))
            .map(|(p, _)| p.clone())
            .collect();
        let mut matched: Vec<String> = Vec::new();
        for command in commands {
            if compiled.iter().any(|re| re.is_match(&command)) && !matched.contains(&command) {
                matched.push(command);
            }
        }
        Ok((matched, missing))
    }
}

impl InputTap for Verifier {
    fn record_input(&self, session_id: &str, data: &[u8]) {
        self.record(session_id, data);
    }
}

fn compile(pattern: &str) -> Result<Regex, VerifyError> {
    Regex::new(pattern).map_err(|e| VerifyError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
