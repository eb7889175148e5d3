use serde::{Deserialize, Serialize};

/// One rung of the detection ladder. The request shape is identical across
/// rungs; only the directive handed to the model changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStrategy {
    pub level: u8,
    pub name: String,
    pub directive: String,
}

impl DetectionStrategy {
    pub fn new(level: u8, name: impl Into<String>, directive: impl Into<String>) -> Self {
        Self {
            level,
            name: name.into(),
            directive: directive.into(),
        }
    }
}

/// The standard four-level ladder, strictest first. Level 4 applies no filtering.
pub fn default_ladder() -> Vec<DetectionStrategy> {
    vec![
        DetectionStrategy::new(
            1,
            "boundary-separation",
            "Treat each print as separate even where prints overlap or touch. \
             Draw tight boxes along the visible paper edge of each print.",
        ),
        DetectionStrategy::new(
            2,
            "edge-sensitivity",
            "Look for faint or low-contrast paper edges, white borders against a white \
             scanner bed and shadows cast by curled corners.",
        ),
        DetectionStrategy::new(
            3,
            "fragment-merging",
            "Merge fragments that belong to one physical print, such as a torn photo or a \
             print split by a crease, into a single box.",
        ),
        DetectionStrategy::new(
            4,
            "unrestricted",
            "Report every rectangular photographic object you can see without filtering.",
        ),
    ]
}
