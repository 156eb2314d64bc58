/// Timeline markers (chapters, notes, in/out points).
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker ID
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MarkerId(pub Uuid);

impl MarkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MarkerId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerType {
    /// Standard marker
    Standard,

    /// Chapter marker (for export)
    Chapter,

    /// Comment/note marker
    Comment,
}

impl Default for MarkerType {
    fn default() -> Self {
        Self::Standard
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    pub at_sec: f64,
    pub label: String,
    #[serde(default)]
    pub marker_type: MarkerType,

    /// Color in hex format (e.g., "#FF0000")
    #[serde(default = "default_marker_color")]
    pub color: String,

    /// Optional note/comment
    #[serde(default)]
    pub note: String,

    /// Creation timestamp (unix seconds)
    #[serde(default)]
    pub created_at: i64,
}

fn default_marker_color() -> String {
    "#4A9EFF".to_string() // Blue
}

impl Marker {
    pub fn new(at_sec: f64, label: impl Into<String>) -> Self {
        Self {
            id: MarkerId::new(),
            at_sec,
            label: label.into(),
            marker_type: MarkerType::default(),
            color: default_marker_color(),
            note: String::new(),
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn chapter(at_sec: f64, label: impl Into<String>) -> Self {
        Self {
            marker_type: MarkerType::Chapter,
            ..Self::new(at_sec, label)
        }
    }
}
