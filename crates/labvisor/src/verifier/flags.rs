//! Flag capture.

use std::collections::BTreeSet;

use dashmap::DashMap;
use log::info;

use labvisor_protocol::{FlagResult, FlagSpec};

pub const DEFAULT_FLAG_POINTS: u32 = 100;

#[derive(Debug, Default)]
struct SessionFlags {
    flags: Vec<FlagSpec>,
    captured: BTreeSet<String>,
    total_points: u32,
}

/// Per-session flag sets and captures.
#[derive(Debug, Default)]
pub struct FlagBoard {
    sessions: DashMap<String, SessionFlags>,
}

impl FlagBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the flag set for a session, keeping earlier captures of flags
    /// that are still present.
    pub fn configure(&self, session_id: &str, flags: Vec<FlagSpec>) {
        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        entry
            .captured
            .retain(|id| flags.iter().any(|f| &f.id == id));
        entry.total_points = entry
            .captured
            .iter()
            .filter_map(|id| flags.iter().find(|f| &f.id == id))
            .map(points_for)
            .sum();
        entry.flags = flags;
    }

    /// Check a submitted value. Resubmitting a captured flag succeeds
    /// without awarding points again.
    pub fn submit(&self, session_id: &str, value: &str) -> FlagResult {
        let value = value.trim();
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return FlagResult {
                correct: false,
                flag_id: None,
                points_awarded: 0,
                already_captured: false,
                total_points: 0,
            };
        };
        let found = entry
            .flags
            .iter()
            .find(|f| f.value == value)
            .map(|f| (f.id.clone(), points_for(f)));

        match found {
            None => FlagResult {
                correct: false,
                flag_id: None,
                points_awarded: 0,
                already_captured: false,
                total_points: entry.total_points,
            },
            Some((id, _)) if entry.captured.contains(&id) => FlagResult {
                correct: true,
                flag_id: Some(id),
                points_awarded: 0,
                already_captured: true,
                total_points: entry.total_points,
            },
            Some((id, points)) => {
                entry.captured.insert(id.clone());
                entry.total_points += points;
                info!("Session {} captured flag {} (+{})", session_id, id, points);
                FlagResult {
                    correct: true,
                    flag_id: Some(id),
                    points_awarded: points,
                    already_captured: false,
                    total_points: entry.total_points,
                }
            }
        }
    }

    pub fn captured(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|e| e.captured.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

fn points_for(flag: &FlagSpec) -> u32 {
    flag.points.unwrap_or(DEFAULT_FLAG_POINTS)
}
