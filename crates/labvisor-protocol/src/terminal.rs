//! Terminal WebSocket framing.
//!
//! Client -> server:
//!   binary frame            = raw input bytes
//!   text frame              = raw input, unless it parses as a control message
//!   `{"resize":{"cols":N,"rows":N}}` = resize request
//!
//! Server -> client:
//!   binary frame            = raw terminal output
//!   text frame (JSON)       = [`TerminalServerNotice`]

use serde::{Deserialize, Serialize};

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalClientFrame {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    resize: ResizeBody,
}

#[derive(Debug, Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

impl TerminalClientFrame {
    /// Decode a text frame. Anything that is not a well-formed control
    /// message is treated as typed input.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{')
            && let Ok(control) = serde_json::from_str::<ControlMessage>(trimmed)
        {
            return TerminalClientFrame::Resize {
                cols: control.resize.cols,
                rows: control.resize.rows,
            };
        }
        TerminalClientFrame::Input(text.as_bytes().to_vec())
    }

    pub fn from_binary(data: &[u8]) -> Self {
        TerminalClientFrame::Input(data.to_vec())
    }
}

/// Out-of-band notices sent to the terminal client as JSON text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalServerNotice {
    Attached {
        shell: String,
        resize_supported: bool,
    },
    Closed {
        reason: String,
    },
    Error {
        message: String,
    },
}
