//! The four-section content record and the `###` delimiter protocol used to
//! carve it out of generated text.
//!
//! Generated text looks like:
//!
//! ```text
//! ### General Information
//! Causes yellowing.
//! ### Symptoms
//! Spots.
//! ...
//! ```
//!
//! Fragments are classified by their leading header, so section order does
//! not matter. Header wording must match exactly; fragments with any other
//! header are dropped and logged.

use crate::error::ContentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SECTION_DELIMITER: &str = "###";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    General,
    Symptoms,
    Treatment,
    Prevention,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::General,
        Section::Symptoms,
        Section::Treatment,
        Section::Prevention,
    ];

    /// Header token that introduces this section in generated text.
    pub fn header(self) -> &'static str {
        match self {
            Section::General => "General Information",
            Section::Symptoms => "Symptoms",
            Section::Treatment => "Treatment",
            Section::Prevention => "Prevention",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Section::General => "general",
            Section::Symptoms => "symptoms",
            Section::Treatment => "treatment",
            Section::Prevention => "prevention",
        }
    }

    fn classify(fragment: &str) -> Option<(Section, &str)> {
        Section::ALL.into_iter().find_map(|section| {
            fragment
                .strip_prefix(section.header())
                .map(|rest| (section, rest))
        })
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Section::ALL
            .into_iter()
            .find(|section| {
                section.as_str() == lower || section.header().to_ascii_lowercase() == lower
            })
            .ok_or_else(|| format!("unknown section: {s}"))
    }
}

/// Descriptive text for one category. Valid only when every field is
/// non-blank; see [`ContentSections::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSections {
    pub general: String,
    pub symptoms: String,
    pub treatment: String,
    pub prevention: String,
}

impl ContentSections {
    pub fn get(&self, section: Section) -> &str {
        match section {
            Section::General => &self.general,
            Section::Symptoms => &self.symptoms,
            Section::Treatment => &self.treatment,
            Section::Prevention => &self.prevention,
        }
    }

    fn slot(&mut self, section: Section) -> &mut String {
        match section {
            Section::General => &mut self.general,
            Section::Symptoms => &mut self.symptoms,
            Section::Treatment => &mut self.treatment,
            Section::Prevention => &mut self.prevention,
        }
    }

    /// Copy of `self` with one field replaced.
    pub fn with_section(&self, section: Section, text: impl Into<String>) -> Self {
        let mut next = self.clone();
        *next.slot(section) = text.into();
        next
    }

    pub fn missing(&self) -> Vec<Section> {
        Section::ALL
            .into_iter()
            .filter(|section| self.get(*section).trim().is_empty())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    pub fn validate(&self) -> Result<(), ContentError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ContentError::IncompleteContent { missing })
        }
    }
}

fn section_body(rest: &str) -> &str {
    let rest = rest.trim_start_matches([' ', '\t']);
    rest.strip_prefix(':').unwrap_or(rest).trim()
}

/// Split generated text into the four sections.
pub fn parse_sections(raw: &str) -> Result<ContentSections, ContentError> {
    let mut sections = ContentSections::default();
    for fragment in raw.split(SECTION_DELIMITER).map(str::trim) {
        if fragment.is_empty() {
            continue;
        }
        let Some((section, rest)) = Section::classify(fragment) else {
            log::warn!(
                "discarding content fragment with unknown header: {:?}",
                fragment.lines().next().unwrap_or_default()
            );
            continue;
        };
        let body = section_body(rest);
        let slot = sections.slot(section);
        if slot.is_empty() {
            *slot = body.to_string();
        } else if !body.is_empty() {
            log::warn!("duplicate {section} section in generated content, keeping the first");
        }
    }
    sections.validate()?;
    Ok(sections)
}

/// Extract one section's text from a response to a single-section prompt.
/// Delimited replies must carry the expected header; a plain reply is taken
/// whole.
pub fn parse_single_section(raw: &str, section: Section) -> Result<String, ContentError> {
    let incomplete = || ContentError::IncompleteContent {
        missing: vec![section],
    };
    if !raw.contains(SECTION_DELIMITER) {
        let text = raw.trim();
        return if text.is_empty() {
            Err(incomplete())
        } else {
            Ok(text.to_string())
        };
    }
    raw.split(SECTION_DELIMITER)
        .map(str::trim)
        .filter_map(Section::classify)
        .filter(|(found, _)| *found == section)
        .map(|(_, rest)| section_body(rest))
        .find(|body| !body.is_empty())
        .map(str::to_string)
        .ok_or_else(incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "### General Information\nCauses yellowing.\n### Symptoms\nSpots.\n### Treatment\nFungicide.\n### Prevention\nDrainage.";

    fn expected() -> ContentSections {
        ContentSections {
            general: "Causes yellowing.".into(),
            symptoms: "Spots.".into(),
            treatment: "Fungicide.".into(),
            prevention: "Drainage.".into(),
        }
    }

    #[test]
    fn parses_canonical_text() {
        assert_eq!(parse_sections(CANONICAL).unwrap(), expected());
    }

    #[test]
    fn parsing_is_idempotent() {
        assert_eq!(parse_sections(CANONICAL).unwrap(), parse_sections(CANONICAL).unwrap());
    }

    #[test]
    fn section_order_does_not_matter() {
        let shuffled = "### Prevention\nDrainage.\n### General Information\nCauses yellowing.\n### Treatment\nFungicide.\n### Symptoms\nSpots.";
        assert_eq!(parse_sections(shuffled).unwrap(), parse_sections(CANONICAL).unwrap());
    }

    #[test]
    fn missing_prevention_is_incomplete() {
        let raw = "### General Information\nA.\n### Symptoms\nB.\n### Treatment\nC.";
        assert_eq!(
            parse_sections(raw),
            Err(ContentError::IncompleteContent {
                missing: vec![Section::Prevention]
            })
        );
    }

    #[test]
    fn empty_body_is_incomplete() {
        let raw = "### General Information\nA.\n### Symptoms\n\n### Treatment\nC.\n### Prevention\nD.";
        assert!(matches!(
            parse_sections(raw),
            Err(ContentError::IncompleteContent { missing }) if missing == vec![Section::Symptoms]
        ));
    }

    #[test]
    fn unknown_fragments_and_preamble_are_dropped() {
        let raw = format!("Here you go!\n{CANONICAL}\n### Sources\nNone.");
        assert_eq!(parse_sections(&raw).unwrap(), expected());
    }

    #[test]
    fn header_colon_and_duplicates() {
        let raw = "### Symptoms: Spots.\n### Symptoms\nLater.\n### General Information\nG\n### Treatment\nT\n### Prevention\nP";
        let parsed = parse_sections(raw).unwrap();
        assert_eq!(parsed.symptoms, "Spots.");
    }

    #[test]
    fn single_section_with_and_without_header() {
        assert_eq!(
            parse_single_section("### Treatment\nSpray.", Section::Treatment).unwrap(),
            "Spray."
        );
        assert_eq!(
            parse_single_section("  Spray early.\n", Section::Treatment).unwrap(),
            "Spray early."
        );
        assert!(parse_single_section("   ", Section::Treatment).is_err());
        assert!(parse_single_section("### Symptoms\nSpots.", Section::Treatment).is_err());
    }

    #[test]
    fn with_section_copies() {
        let base = expected();
        let next = base.with_section(Section::Treatment, "New.");
        assert_eq!(base.treatment, "Fungicide.");
        assert_eq!(next.treatment, "New.");
        assert_eq!(next.general, base.general);
    }

    #[test]
    fn section_names_round_trip_through_from_str() {
        assert_eq!("treatment".parse::<Section>(), Ok(Section::Treatment));
        assert_eq!("General Information".parse::<Section>(), Ok(Section::General));
        assert!("history".parse::<Section>().is_err());
    }
}
