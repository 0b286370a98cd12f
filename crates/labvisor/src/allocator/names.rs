//! Deterministic resource names.
//!
//! Names are pure functions of IDs so a restarted process can rediscover
//! what it created without a side table.

use sha2::{Digest, Sha256};

use labvisor_protocol::SessionKind;

const VOLUME_PREFIX: &str = "labvisor-home-";
const NETWORK_PREFIX: &str = "labvisor-net-";
const UNIT_PREFIX: &str = "lab-";

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Lowercase alphanumerics and dashes only, trimmed to `max` characters.
fn sanitize(input: &str, max: usize) -> String {
    let mut out: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(max)
        .collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Home volume for a user. Stable across process restarts.
pub fn volume_name_for(user_id: &str) -> String {
    format!("{}{}", VOLUME_PREFIX, short_hash(user_id))
}

/// Volume attached to a session of `kind`.
///
/// Persistent terminal and desktop environments of one user share the same
/// volume so work survives switching between them. Ephemeral labs get none.
pub fn volume_for_session(user_id: &str, kind: SessionKind) -> Option<String> {
    if kind.is_persistent() {
        Some(volume_name_for(user_id))
    } else {
        None
    }
}

/// Per-session isolated network.
pub fn network_name_for(session_id: &str) -> String {
    format!("{}{}", NETWORK_PREFIX, short_hash(session_id))
}

/// Backend unit name (container, pod or VM). DNS-1123 compatible.
pub fn unit_name_for(session_id: &str) -> String {
    let readable = sanitize(session_id, 32);
    let hash = &short_hash(session_id)[..8];
    if readable.is_empty() {
        format!("{}{}", UNIT_PREFIX, hash)
    } else {
        format!("{}{}-{}", UNIT_PREFIX, readable, hash)
    }
}
