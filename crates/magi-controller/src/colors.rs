//! Deterministic per-task colors for the UI grid.
//!
//! The palette assignment is a pure function of the process id so every
//! client renders the same task in the same color without coordination.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Serialized camelCase (`bgColor`/`textColor`) to match the UI socket
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Colors {
    pub bg_color: String,
    pub text_color: String,
}

/// (background, text) pairs with readable contrast.
const PALETTE: &[(&str, &str)] = &[
    ("#1e3a5f", "#e8f1fb"),
    ("#4a1e5f", "#f3e8fb"),
    ("#1e5f3a", "#e8fbf1"),
    ("#5f3a1e", "#fbf1e8"),
    ("#5f1e2e", "#fbe8ed"),
    ("#2e5f1e", "#edfbe8"),
    ("#1e4a5f", "#e8f5fb"),
    ("#5f5f1e", "#fbfbe8"),
];

pub fn colors_for(process_id: &str) -> Colors {
    let digest = Sha256::digest(process_id.as_bytes());
    let index = digest[0] as usize % PALETTE.len();
    let (bg, text) = PALETTE[index];
    Colors {
        bg_color: bg.into(),
        text_color: text.into(),
    }
}
