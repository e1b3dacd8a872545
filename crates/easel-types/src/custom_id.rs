// Button custom-id grammar.
// These shapes come off the wire and must be parsed bit-exactly; the
// follow-up action dispatch and the modal rewrite rules both key off them.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanDirection {
    Left,
    Right,
    Up,
    Down,
}

impl PanDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PanDirection::Left => "left",
            PanDirection::Right => "right",
            PanDirection::Up => "up",
            PanDirection::Down => "down",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(PanDirection::Left),
            "right" => Some(PanDirection::Right),
            "up" => Some(PanDirection::Up),
            "down" => Some(PanDirection::Down),
            _ => None,
        }
    }
}

impl fmt::Display for PanDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicReaderTarget {
    All,
    Index(u8),
}

/// A parsed button custom id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCustomId {
    /// `MJ::JOB::upsample::{index}::{hash}`
    Upsample { index: u8, hash: String },
    /// `MJ::JOB::variation::{index}::{hash}`
    Variation { index: u8, hash: String },
    /// `MJ::JOB::low_variation::{index}::{hash}::SOLO` and the high variant.
    VariationStrength { high: bool, index: u8, hash: String },
    /// `MJ::JOB::reroll::0::{hash}::SOLO`
    Reroll { hash: String },
    /// `MJ::JOB::pan_{dir}::{index}::{hash}::SOLO`
    Pan { direction: PanDirection, index: u8, hash: String },
    /// `MJ::JOB::PicReader::{1..4|all}`
    PicReader { target: PicReaderTarget },
    /// `MJ::Job::PromptAnalyzer::{N}` (note the mixed-case `Job`)
    PromptAnalyzer { index: u8 },
    /// `MJ::CustomZoom::{hash}`
    CustomZoom { hash: String },
    /// `MJ::Inpaint::{...}`
    Inpaint { rest: String },
    /// `MJ::BOOKMARK::{...}`
    Bookmark { rest: String },
    /// `MJ::RemixModal::{hash}::{index}::{0|1}`
    RemixModal { hash: String, index: u8, high_variability: bool },
    /// `MJ::PanModal::{dir}::{hash}::{index}`
    PanModal { direction: PanDirection, hash: String, index: u8 },
    /// `MJ::ImagineModal::{messageId}`
    ImagineModal { message_id: String },
    /// `MJ::Settings::HighVariabilityMode::{0|1}`
    HighVariabilityMode { enabled: bool },
}

impl ParsedCustomId {
    /// Parse a custom id off the wire. Returns `None` for unknown shapes.
    pub fn parse(custom_id: &str) -> Option<ParsedCustomId> {
        let parts: Vec<&str> = custom_id.split("::").collect();
        if parts.first() != Some(&"MJ") {
            return None;
        }

        match parts.get(1).copied() {
            Some("JOB") => parse_job(&parts),
            Some("Job") => match parts.get(2).copied() {
                Some("PromptAnalyzer") => {
                    let index = parts.get(3)?.parse().ok()?;
                    Some(ParsedCustomId::PromptAnalyzer { index })
                }
                _ => None,
            },
            Some("CustomZoom") => Some(ParsedCustomId::CustomZoom {
                hash: parts.get(2)?.to_string(),
            }),
            Some("Inpaint") => Some(ParsedCustomId::Inpaint {
                rest: parts[2..].join("::"),
            }),
            Some("BOOKMARK") => Some(ParsedCustomId::Bookmark {
                rest: parts[2..].join("::"),
            }),
            Some("RemixModal") => {
                let hash = parts.get(2)?.to_string();
                let index = parts.get(3)?.parse().ok()?;
                let high_variability = match parts.get(4).copied() {
                    Some("1") => true,
                    Some("0") => false,
                    _ => return None,
                };
                Some(ParsedCustomId::RemixModal {
                    hash,
                    index,
                    high_variability,
                })
            }
            Some("PanModal") => {
                let direction = PanDirection::parse(parts.get(2)?)?;
                let hash = parts.get(3)?.to_string();
                let index = parts.get(4)?.parse().ok()?;
                Some(ParsedCustomId::PanModal {
                    direction,
                    hash,
                    index,
                })
            }
            Some("ImagineModal") => Some(ParsedCustomId::ImagineModal {
                message_id: parts.get(2)?.to_string(),
            }),
            Some("Settings") => match parts.get(2).copied() {
                Some("HighVariabilityMode") => {
                    let enabled = match parts.get(3).copied() {
                        Some("1") => true,
                        Some("0") => false,
                        _ => return None,
                    };
                    Some(ParsedCustomId::HighVariabilityMode { enabled })
                }
                _ => None,
            },
            _ => None,
        }
    }
}

fn parse_job(parts: &[&str]) -> Option<ParsedCustomId> {
    let op = parts.get(2).copied()?;
    if let Some(dir) = op.strip_prefix("pan_") {
        let direction = PanDirection::parse(dir)?;
        let index = parts.get(3)?.parse().ok()?;
        let hash = parts.get(4)?.to_string();
        return Some(ParsedCustomId::Pan {
            direction,
            index,
            hash,
        });
    }
    match op {
        "upsample" => Some(ParsedCustomId::Upsample {
            index: parts.get(3)?.parse().ok()?,
            hash: parts.get(4)?.to_string(),
        }),
        "variation" => Some(ParsedCustomId::Variation {
            index: parts.get(3)?.parse().ok()?,
            hash: parts.get(4)?.to_string(),
        }),
        "low_variation" | "high_variation" => Some(ParsedCustomId::VariationStrength {
            high: op == "high_variation",
            index: parts.get(3)?.parse().ok()?,
            hash: parts.get(4)?.to_string(),
        }),
        "reroll" => Some(ParsedCustomId::Reroll {
            hash: parts.get(4)?.to_string(),
        }),
        "PicReader" => match parts.get(3).copied()? {
            "all" => Some(ParsedCustomId::PicReader {
                target: PicReaderTarget::All,
            }),
            n => {
                let index: u8 = n.parse().ok()?;
                (1..=4).contains(&index).then_some(ParsedCustomId::PicReader {
                    target: PicReaderTarget::Index(index),
                })
            }
        },
        _ => None,
    }
}

/// Synthesize a `PanModal` custom id from a parent upsample custom id, as
/// the remix rewrite for PAN follow-ups requires.
pub fn pan_modal_from_upsample(direction: PanDirection, u_custom_id: &str) -> Option<String> {
    match ParsedCustomId::parse(u_custom_id)? {
        ParsedCustomId::Upsample { index, hash } => {
            Some(format!("MJ::PanModal::{direction}::{hash}::{index}"))
        }
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upsample_and_variation() {
        assert_eq!(
            ParsedCustomId::parse("MJ::JOB::upsample::3::abc-123"),
            Some(ParsedCustomId::Upsample {
                index: 3,
                hash: "abc-123".to_string()
            })
        );
        assert_eq!(
            ParsedCustomId::parse("MJ::JOB::variation::1::abc-123"),
            Some(ParsedCustomId::Variation {
                index: 1,
                hash: "abc-123".to_string()
            })
        );
    }

    #[test]
    fn parses_reroll_solo() {
        assert_eq!(
            ParsedCustomId::parse("MJ::JOB::reroll::0::deadbeef::SOLO"),
            Some(ParsedCustomId::Reroll {
                hash: "deadbeef".to_string()
            })
        );
    }

    #[test]
    fn parses_pan_shapes() {
        assert_eq!(
            ParsedCustomId::parse("MJ::JOB::pan_left::3::HASH::SOLO"),
            Some(ParsedCustomId::Pan {
                direction: PanDirection::Left,
                index: 3,
                hash: "HASH".to_string()
            })
        );
        assert_eq!(
            ParsedCustomId::parse("MJ::PanModal::down::HASH::2"),
            Some(ParsedCustomId::PanModal {
                direction: PanDirection::Down,
                hash: "HASH".to_string(),
                index: 2
            })
        );
    }

    #[test]
    fn parses_pic_reader_targets() {
        assert_eq!(
            ParsedCustomId::parse("MJ::JOB::PicReader::all"),
            Some(ParsedCustomId::PicReader {
                target: PicReaderTarget::All
            })
        );
        assert_eq!(
            ParsedCustomId::parse("MJ::JOB::PicReader::4"),
            Some(ParsedCustomId::PicReader {
                target: PicReaderTarget::Index(4)
            })
        );
        assert_eq!(ParsedCustomId::parse("MJ::JOB::PicReader::5"), None);
    }

    #[test]
    fn parses_prompt_analyzer_mixed_case() {
        assert_eq!(
            ParsedCustomId::parse("MJ::Job::PromptAnalyzer::2"),
            Some(ParsedCustomId::PromptAnalyzer { index: 2 })
        );
        // The all-caps JOB namespace does not carry PromptAnalyzer.
        assert_eq!(ParsedCustomId::parse("MJ::JOB::PromptAnalyzer::2"), None);
    }

    #[test]
    fn parses_modal_shapes() {
        assert_eq!(
            ParsedCustomId::parse("MJ::RemixModal::HASH::2::1"),
            Some(ParsedCustomId::RemixModal {
                hash: "HASH".to_string(),
                index: 2,
                high_variability: true
            })
        );
        assert_eq!(
            ParsedCustomId::parse("MJ::ImagineModal::112233"),
            Some(ParsedCustomId::ImagineModal {
                message_id: "112233".to_string()
            })
        );
        assert_eq!(
            ParsedCustomId::parse("MJ::Settings::HighVariabilityMode::0"),
            Some(ParsedCustomId::HighVariabilityMode { enabled: false })
        );
    }

    #[test]
    fn pan_modal_synthesis_from_upsample() {
        let rewritten = pan_modal_from_upsample(PanDirection::Left, "MJ::JOB::upsample::3::HASH");
        assert_eq!(rewritten.as_deref(), Some("MJ::PanModal::left::HASH::3"));
        assert!(pan_modal_from_upsample(PanDirection::Left, "MJ::CustomZoom::HASH").is_none());
    }

    #[test]
    fn rejects_foreign_namespaces() {
        assert_eq!(ParsedCustomId::parse("XX::JOB::upsample::1::h"), None);
        assert_eq!(ParsedCustomId::parse("MJ::Unknown::thing"), None);
    }
}
