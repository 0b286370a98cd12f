//! Objective verification and flag capture types.

use serde::{Deserialize, Serialize};

/// How to decide whether a lab objective has been met.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifyRule {
    /// Any recorded command matches the pattern.
    Regex { pattern: String },
    /// Every pattern matches at least one recorded command.
    AllOf { patterns: Vec<String> },
    /// At least one pattern matches a recorded command.
    AnyOf { patterns: Vec<String> },
    /// Run a script inside the lab unit; exit code 0 means success.
    Script {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub passed: bool,
    /// Commands (or patterns, for script rules the script output) that matched.
    #[serde(default)]
    pub matched: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A capturable flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSpec {
    pub id: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagResult {
    pub correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_id: Option<String>,
    pub points_awarded: u32,
    pub already_captured: bool,
    pub total_points: u32,
}
