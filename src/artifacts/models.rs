//! Structured artifact schemas produced by generation tasks.
//!
//! Each schema implements [`Validate`], which performs the field presence,
//! type and bounds checks that `serde` alone cannot express.

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

/// Schema-level checks run immediately after a generated value is decoded.
pub trait Validate {
    /// Schema name used in error messages.
    const SCHEMA: &'static str;

    /// Checks field presence and bounds.
    fn validate(&self) -> Result<(), ArtifactError>;
}

fn require_text(schema: &'static str, field: &str, value: &str) -> Result<(), ArtifactError> {
    if value.trim().is_empty() {
        return Err(ArtifactError::MissingField {
            schema,
            field: field.to_string(),
        });
    }
    Ok(())
}

fn require_items(
    schema: &'static str,
    field: &str,
    items: &[String],
    min: usize,
    max: usize,
) -> Result<(), ArtifactError> {
    if items.len() < min || items.len() > max {
        return Err(ArtifactError::OutOfBounds {
            schema,
            field: field.to_string(),
            reason: format!("expected {}..={} entries, got {}", min, max, items.len()),
        });
    }
    if let Some(pos) = items.iter().position(|s| s.trim().is_empty()) {
        return Err(ArtifactError::MissingField {
            schema,
            field: format!("{}[{}]", field, pos),
        });
    }
    Ok(())
}

fn require_range<T>(
    schema: &'static str,
    field: &str,
    value: T,
    min: T,
    max: T,
) -> Result<(), ArtifactError>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if value < min || value > max {
        return Err(ArtifactError::OutOfBounds {
            schema,
            field: field.to_string(),
            reason: format!("{} not in [{}, {}]", value, min, max),
        });
    }
    Ok(())
}

// ============================================================================
// Intent
// ============================================================================

/// Structured representation of a user's story request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIntent {
    /// Target age of the audience in years.
    pub age: u32,
    /// Story themes, topics or elements requested.
    pub themes: Vec<String>,
    /// Desired emotional tone.
    pub tone: String,
    /// Story genre.
    pub genre: String,
    /// Approximate reading/listening time in minutes.
    pub length_minutes: u32,
    /// Optional content restrictions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_constraints: Option<Vec<String>>,
}

impl Validate for UserIntent {
    const SCHEMA: &'static str = "UserIntent";

    fn validate(&self) -> Result<(), ArtifactError> {
        require_range(Self::SCHEMA, "age", self.age, 1, 100)?;
        require_items(Self::SCHEMA, "themes", &self.themes, 1, usize::MAX)?;
        require_text(Self::SCHEMA, "tone", &self.tone)?;
        require_text(Self::SCHEMA, "genre", &self.genre)?;
        require_range(Self::SCHEMA, "length_minutes", self.length_minutes, 1, 120)?;
        if let Some(constraints) = &self.safety_constraints {
            require_items(
                Self::SCHEMA,
                "safety_constraints",
                constraints,
                0,
                usize::MAX,
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// World
// ============================================================================

/// A story world: setting, governing rules and landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub name: String,
    pub description: String,
    pub rules: Vec<String>,
    pub locations: Vec<String>,
    pub aesthetic: String,
}

impl Validate for World {
    const SCHEMA: &'static str = "World";

    fn validate(&self) -> Result<(), ArtifactError> {
        require_text(Self::SCHEMA, "name", &self.name)?;
        require_text(Self::SCHEMA, "description", &self.description)?;
        require_items(Self::SCHEMA, "rules", &self.rules, 1, 8)?;
        require_items(Self::SCHEMA, "locations", &self.locations, 1, 10)?;
        require_text(Self::SCHEMA, "aesthetic", &self.aesthetic)
    }
}

// ============================================================================
// Characters
// ============================================================================

/// A single story character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub species: String,
    /// Narrative function (protagonist, mentor, sidekick, ...).
    pub role: String,
    #[serde(default)]
    pub physical_traits: Vec<String>,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub motivations: String,
    #[serde(default)]
    pub goals: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<String>,
}

/// The cast produced by the character task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRoster {
    pub characters: Vec<Character>,
}

impl Validate for CharacterRoster {
    const SCHEMA: &'static str = "CharacterRoster";

    fn validate(&self) -> Result<(), ArtifactError> {
        let count = self.characters.len();
        if !(1..=6).contains(&count) {
            return Err(ArtifactError::OutOfBounds {
                schema: Self::SCHEMA,
                field: "characters".to_string(),
                reason: format!("expected 1..=6 characters, got {}", count),
            });
        }
        for (idx, character) in self.characters.iter().enumerate() {
            require_text(Self::SCHEMA, &format!("characters[{}].name", idx), &character.name)?;
            require_text(
                Self::SCHEMA,
                &format!("characters[{}].species", idx),
                &character.species,
            )?;
            require_text(Self::SCHEMA, &format!("characters[{}].role", idx), &character.role)?;
        }
        Ok(())
    }
}

// ============================================================================
// Plot
// ============================================================================

/// Classic story structure with plot beats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plot {
    pub setup: String,
    pub conflict: String,
    pub rising_action: Vec<String>,
    pub climax: String,
    pub resolution: String,
    pub themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_hook: Option<String>,
}

impl Validate for Plot {
    const SCHEMA: &'static str = "Plot";

    fn validate(&self) -> Result<(), ArtifactError> {
        require_text(Self::SCHEMA, "setup", &self.setup)?;
        require_text(Self::SCHEMA, "conflict", &self.conflict)?;
        require_items(Self::SCHEMA, "rising_action", &self.rising_action, 1, usize::MAX)?;
        require_text(Self::SCHEMA, "climax", &self.climax)?;
        require_text(Self::SCHEMA, "resolution", &self.resolution)?;
        require_items(Self::SCHEMA, "themes", &self.themes, 1, usize::MAX)
    }
}

// ============================================================================
// Story
// ============================================================================

/// A complete story: the draft, a revision, or an edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub title: String,
    pub text: String,
    pub word_count: u32,
    pub estimated_reading_time_minutes: u32,
    pub tone: String,
    pub reading_level: String,
}

impl Story {
    /// Minimum length of the narrative prose, in characters.
    pub const MIN_TEXT_CHARS: usize = 100;
    /// Minimum declared word count.
    pub const MIN_WORDS: u32 = 50;
}

impl Validate for Story {
    const SCHEMA: &'static str = "Story";

    fn validate(&self) -> Result<(), ArtifactError> {
        require_text(Self::SCHEMA, "title", &self.title)?;
        let chars = self.text.trim().chars().count();
        if chars < Self::MIN_TEXT_CHARS {
            return Err(ArtifactError::OutOfBounds {
                schema: Self::SCHEMA,
                field: "text".to_string(),
                reason: format!(
                    "{} characters, at least {} required",
                    chars,
                    Self::MIN_TEXT_CHARS
                ),
            });
        }
        require_range(
            Self::SCHEMA,
            "word_count",
            self.word_count,
            Self::MIN_WORDS,
            u32::MAX,
        )?;
        require_range(
            Self::SCHEMA,
            "estimated_reading_time_minutes",
            self.estimated_reading_time_minutes,
            1,
            u32::MAX,
        )?;
        require_text(Self::SCHEMA, "tone", &self.tone)?;
        require_text(Self::SCHEMA, "reading_level", &self.reading_level)
    }
}

// ============================================================================
// Critique
// ============================================================================

/// Outcome of a critique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    Revise,
}

impl Verdict {
    /// The exit-signal token.
    pub const APPROVAL_MARKER: &'static str = "APPROVED";

    /// Parses a verdict token.
    ///
    /// The token is trimmed and upper-cased, then compared for equality.
    /// `"approved"` and `" APPROVED "` are approvals; `"Not APPROVED yet"`
    /// is not a verdict at all.
    pub fn parse(token: &str) -> Option<Self> {
        let normalized = token.trim().to_ascii_uppercase();
        match normalized.as_str() {
            Self::APPROVAL_MARKER => Some(Verdict::Approved),
            "REVISE" | "NEEDS_REVISION" => Some(Verdict::Revise),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Approved => write!(f, "APPROVED"),
            Verdict::Revise => write!(f, "REVISE"),
        }
    }
}

/// Wire shape of a critique before verdict normalization.
#[derive(Debug, Deserialize)]
struct RawCritique {
    #[serde(alias = "status")]
    verdict: String,
    #[serde(default)]
    feedback: Option<String>,
}

/// Critic output consumed by one refinement iteration.
///
/// `feedback` is present only for [`Verdict::Revise`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCritique")]
pub struct Critique {
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Critique {
    pub fn approved() -> Self {
        Self {
            verdict: Verdict::Approved,
            feedback: None,
        }
    }

    pub fn revise(feedback: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Revise,
            feedback: Some(feedback.into()),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

impl TryFrom<RawCritique> for Critique {
    type Error = ArtifactError;

    fn try_from(raw: RawCritique) -> Result<Self, Self::Error> {
        let verdict = Verdict::parse(&raw.verdict).ok_or_else(|| ArtifactError::InvalidValue {
            schema: Critique::SCHEMA,
            field: "verdict".to_string(),
            reason: format!("'{}' is not APPROVED or REVISE", raw.verdict),
        })?;
        let feedback = match verdict {
            Verdict::Approved => None,
            Verdict::Revise => raw.feedback,
        };
        Ok(Self { verdict, feedback })
    }
}

impl Validate for Critique {
    const SCHEMA: &'static str = "Critique";

    fn validate(&self) -> Result<(), ArtifactError> {
        match (&self.verdict, &self.feedback) {
            (Verdict::Revise, Some(text)) => require_text(Self::SCHEMA, "feedback", text),
            (Verdict::Revise, None) => Err(ArtifactError::MissingField {
                schema: Self::SCHEMA,
                field: "feedback".to_string(),
            }),
            (Verdict::Approved, Some(_)) => Err(ArtifactError::InvalidValue {
                schema: Self::SCHEMA,
                field: "feedback".to_string(),
                reason: "approved critiques carry no feedback".to_string(),
            }),
            (Verdict::Approved, None) => Ok(()),
        }
    }
}

// ============================================================================
// Answer
// ============================================================================

/// Answer to a question about the current story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
}

impl Validate for Answer {
    const SCHEMA: &'static str = "Answer";

    fn validate(&self) -> Result<(), ArtifactError> {
        require_text(Self::SCHEMA, "text", &self.text)
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Raw classifier output. Mapping to a pipeline mode is the router's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingOutput {
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Validate for RoutingOutput {
    const SCHEMA: &'static str = "Routing";

    fn validate(&self) -> Result<(), ArtifactError> {
        require_text(Self::SCHEMA, "decision", &self.decision)?;
        if let Some(confidence) = self.confidence {
            if !confidence.is_finite() {
                return Err(ArtifactError::InvalidValue {
                    schema: Self::SCHEMA,
                    field: "confidence".to_string(),
                    reason: "not a finite number".to_string(),
                });
            }
            require_range(Self::SCHEMA, "confidence", confidence, 0.0, 1.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> UserIntent {
        UserIntent {
            age: 10,
            themes: vec!["space".to_string()],
            tone: "exciting".to_string(),
            genre: "sci-fi".to_string(),
            length_minutes: 10,
            safety_constraints: None,
        }
    }

    #[test]
    fn test_intent_bounds() {
        assert!(intent().validate().is_ok());

        let mut too_old = intent();
        too_old.age = 101;
        assert!(matches!(
            too_old.validate(),
            Err(ArtifactError::OutOfBounds { ref field, .. }) if field == "age"
        ));

        let mut too_long = intent();
        too_long.length_minutes = 121;
        assert!(too_long.validate().is_err());

        let mut zero_length = intent();
        zero_length.length_minutes = 0;
        assert!(zero_length.validate().is_err());

        let mut no_themes = intent();
        no_themes.themes.clear();
        assert!(no_themes.validate().is_err());
    }

    #[test]
    fn test_story_minimums() {
        let story = Story {
            title: "Short".to_string(),
            text: "Too short.".to_string(),
            word_count: 2,
            estimated_reading_time_minutes: 1,
            tone: "calm".to_string(),
            reading_level: "Early reader".to_string(),
        };
        assert!(matches!(
            story.validate(),
            Err(ArtifactError::OutOfBounds { ref field, .. }) if field == "text"
        ));
    }

    #[test]
    fn test_verdict_exact_token() {
        assert_eq!(Verdict::parse("APPROVED"), Some(Verdict::Approved));
        assert_eq!(Verdict::parse("  approved\n"), Some(Verdict::Approved));
        assert_eq!(Verdict::parse("NEEDS_REVISION"), Some(Verdict::Revise));
        assert_eq!(Verdict::parse("REVISE"), Some(Verdict::Revise));
        assert_eq!(Verdict::parse("NOT APPROVED"), None);
        assert_eq!(Verdict::parse("APPROVED, but fix the ending"), None);
    }

    #[test]
    fn test_critique_decodes_legacy_status_field() {
        let critique: Critique =
            serde_json::from_str(r#"{"status": "NEEDS_REVISION", "feedback": "More dialogue"}"#)
                .expect("should decode");
        assert_eq!(critique.verdict, Verdict::Revise);
        assert_eq!(critique.feedback.as_deref(), Some("More dialogue"));
        assert!(critique.validate().is_ok());
    }

    #[test]
    fn test_critique_quoting_marker_is_not_approval() {
        let critique: Critique = serde_json::from_str(
            r#"{"verdict": "REVISE", "feedback": "Do not write APPROVED until the ending lands."}"#,
        )
        .expect("should decode");
        assert!(!critique.is_approved());
    }

    #[test]
    fn test_critique_rejects_unknown_verdict() {
        let result: Result<Critique, _> =
            serde_json::from_str(r#"{"verdict": "APPROVED!!", "feedback": ""}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_critique_revise_requires_feedback() {
        let critique = Critique {
            verdict: Verdict::Revise,
            feedback: Some("   ".to_string()),
        };
        assert!(critique.validate().is_err());
        assert!(Critique::approved().validate().is_ok());
    }

    #[test]
    fn test_roster_bounds() {
        let empty = CharacterRoster { characters: vec![] };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_routing_confidence_bounds() {
        let routing = RoutingOutput {
            decision: "QUESTION".to_string(),
            confidence: Some(1.5),
        };
        assert!(routing.validate().is_err());
    }
}
