//! Audience tier and creative format derived from creative naming
//! conventions. Each label comes from an ordered decision list: the first
//! matching rule wins, and nothing matching means `Unknown`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudienceTier {
    Mobile,
    Desktop,
    Ctv,
    Unknown,
}

impl fmt::Display for AudienceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AudienceTier::Mobile => "Mobile",
            AudienceTier::Desktop => "Desktop",
            AudienceTier::Ctv => "CTV",
            AudienceTier::Unknown => "Unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreativeFormat {
    Banner,
    Video,
    Unknown,
}

impl fmt::Display for CreativeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CreativeFormat::Banner => "Banner",
            CreativeFormat::Video => "Video",
            CreativeFormat::Unknown => "Unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    Prefix(&'static str),
    Contains(&'static str),
}

impl Matcher {
    pub fn matches(self, name: &str) -> bool {
        match self {
            Matcher::Prefix(prefix) => name.starts_with(prefix),
            Matcher::Contains(needle) => name.contains(needle),
        }
    }
}

pub const TIER_RULES: &[(Matcher, AudienceTier)] = &[
    (Matcher::Prefix("MO"), AudienceTier::Mobile),
    (Matcher::Prefix("DE_"), AudienceTier::Desktop),
    (Matcher::Prefix("CTV_"), AudienceTier::Ctv),
];

pub const FORMAT_RULES: &[(Matcher, CreativeFormat)] = &[
    (Matcher::Contains("_BA_"), CreativeFormat::Banner),
    (Matcher::Contains("_RM_"), CreativeFormat::Banner),
    (Matcher::Contains("_VI_"), CreativeFormat::Video),
];

fn first_match<L: Copy>(rules: &[(Matcher, L)], name: &str, fallback: L) -> L {
    rules
        .iter()
        .find(|(matcher, _)| matcher.matches(name))
        .map_or(fallback, |(_, label)| *label)
}

pub fn audience_tier(creative_name: &str) -> AudienceTier {
    first_match(TIER_RULES, creative_name, AudienceTier::Unknown)
}

pub fn creative_format(creative_name: &str) -> CreativeFormat {
    first_match(FORMAT_RULES, creative_name, CreativeFormat::Unknown)
}

/// `{campaign}_{tier}_{format}`.
pub fn composite_label(campaign_id: &str, creative_name: &str) -> String {
    format!(
        "{}_{}_{}",
        campaign_id,
        audience_tier(creative_name),
        creative_format(creative_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_prefix_order() {
        assert_eq!(audience_tier("MO_something"), AudienceTier::Mobile);
        assert_eq!(audience_tier("MOBILE_BA_x"), AudienceTier::Mobile);
        assert_eq!(audience_tier("DE_XYZ"), AudienceTier::Desktop);
        assert_eq!(audience_tier("CTV_ABC"), AudienceTier::Ctv);
        assert_eq!(audience_tier("DEX_1"), AudienceTier::Unknown);
        assert_eq!(audience_tier("mo_lower"), AudienceTier::Unknown);
        assert_eq!(audience_tier(""), AudienceTier::Unknown);
    }

    #[test]
    fn formats_follow_substring_order() {
        assert_eq!(creative_format("X_BA_Y"), CreativeFormat::Banner);
        assert_eq!(creative_format("X_RM_Y"), CreativeFormat::Banner);
        assert_eq!(creative_format("X_VI_Y"), CreativeFormat::Video);
        assert_eq!(creative_format("X_VI_BA_Y"), CreativeFormat::Banner);
        assert_eq!(creative_format("BA_VI"), CreativeFormat::Unknown);
    }

    #[test]
    fn tier_and_format_are_independent() {
        assert_eq!(composite_label("CAMP1", "MO_BA_test"), "CAMP1_Mobile_Banner");
        assert_eq!(composite_label("C", "CTV_VI_30s"), "C_CTV_Video");
        assert_eq!(composite_label("Unknown", "Unknown"), "Unknown_Unknown_Unknown");
        assert_eq!(composite_label("C", "DE_RM_x"), "C_Desktop_Banner");
    }
}
