//! Named prompt templates
//!
//! A provider config refers to a prompt by style name; the text itself lives here so
//! every backend sends the same instructions for the same style.

const DETAILED: &str = "Describe this image in detail, including the main subjects, \
setting, colors, lighting and any visible text. Write in plain prose.";

const CONCISE: &str = "Describe this image in one or two short sentences.";

const NARRATIVE: &str = "Describe this image as a short narrative: what is happening, \
who or what is involved, and the mood of the scene.";

const ARTISTIC: &str = "Describe this image from an artistic perspective: composition, \
color palette, texture, lighting and the overall visual style.";

const TECHNICAL: &str = "Describe this image from a photographic perspective: \
framing, focus and depth of field, exposure, lighting and likely lens choice.";

const COLORFUL: &str = "Describe this image with rich, vivid language, paying \
particular attention to colors and how they interact.";

const SIMPLE: &str = "What is in this image?";

/// Style used when a config does not name one
pub const DEFAULT_STYLE: &str = "detailed";

static TEMPLATES: &[(&str, &str)] = &[
    ("detailed", DETAILED),
    ("concise", CONCISE),
    ("narrative", NARRATIVE),
    ("artistic", ARTISTIC),
    ("technical", TECHNICAL),
    ("colorful", COLORFUL),
    ("simple", SIMPLE),
];

/// Prompt text for a style name (case-insensitive)
pub fn template(style: &str) -> Option<&'static str> {
    TEMPLATES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(style))
        .map(|(_, text)| *text)
}

/// All known style names
pub fn styles() -> impl Iterator<Item = &'static str> {
    TEMPLATES.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(template("Concise"), template("concise"));
        assert!(template("detailed").is_some());
        assert!(template("haiku").is_none());
    }

    #[test]
    fn test_default_style_exists() {
        assert!(template(DEFAULT_STYLE).is_some());
        assert_eq!(styles().count(), 7);
    }
}
