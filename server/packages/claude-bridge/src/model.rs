//! Maps Anthropic API model names onto names the Claude CLI accepts.

const MODEL_MAP: &[(&str, &str)] = &[
    ("sonnet", "sonnet"),
    ("opus", "opus"),
    ("haiku", "haiku"),
    ("claude-sonnet-4", "sonnet"),
    ("claude-opus-4", "opus"),
    ("claude-haiku-4", "haiku"),
    ("claude-3-5-sonnet", "sonnet"),
    ("claude-3-opus", "opus"),
    ("claude-3-haiku", "haiku"),
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4-5-20250929"),
];

const FAMILIES: [&str; 3] = ["sonnet", "opus", "haiku"];

pub fn map_model(requested: &str) -> String {
    if let Some((_, mapped)) = MODEL_MAP.iter().find(|(name, _)| *name == requested) {
        return (*mapped).to_string();
    }

    if requested.starts_with("claude-") {
        let lower = requested.to_ascii_lowercase();
        if let Some(family) = FAMILIES.iter().find(|family| lower.contains(*family)) {
            return (*family).to_string();
        }
    }

    requested.to_string()
}
