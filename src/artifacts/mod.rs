//! Closed set of artifact schemas exchanged between pipeline stages.
//!
//! Every generation task declares the [`ArtifactKind`] it produces. The raw
//! value returned by the generation capability is decoded and validated into
//! an [`Artifact`] at the stage boundary, right after the call returns, so
//! downstream consumers only ever see values that passed their schema.
//!
//! ```
//! use story_forge::artifacts::{Artifact, ArtifactKind};
//!
//! let value = serde_json::json!({"verdict": "APPROVED"});
//! let artifact = Artifact::parse(ArtifactKind::Critique, value).expect("valid critique");
//! assert!(artifact.as_critique().map(|c| c.is_approved()).unwrap_or(false));
//! ```

pub mod models;

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

pub use models::{
    Answer, Character, CharacterRoster, Critique, Plot, RoutingOutput, Story, UserIntent,
    Validate, Verdict, World,
};

/// Version stamped on every stored artifact.
pub const SCHEMA_VERSION: u32 = 1;

/// The schema a generation task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Intent,
    World,
    Characters,
    Plot,
    Story,
    Critique,
    Answer,
    Routing,
}

impl ArtifactKind {
    /// Schema name used in logs and errors.
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::Intent => UserIntent::SCHEMA,
            Self::World => World::SCHEMA,
            Self::Characters => CharacterRoster::SCHEMA,
            Self::Plot => Plot::SCHEMA,
            Self::Story => Story::SCHEMA,
            Self::Critique => Critique::SCHEMA,
            Self::Answer => Answer::SCHEMA,
            Self::Routing => RoutingOutput::SCHEMA,
        }
    }

    /// JSON shape description sent along with schema-constrained requests.
    pub fn schema_hint(&self) -> &'static str {
        match self {
            Self::Intent => {
                r#"{"age": <int 1-100>, "themes": [<string>, ...], "tone": <string>, "genre": <string>, "length_minutes": <int 1-120>, "safety_constraints": [<string>, ...] or null}"#
            }
            Self::World => {
                r#"{"name": <string>, "description": <string>, "rules": [<string>, 1-8 items], "locations": [<string>, 1-10 items], "aesthetic": <string>}"#
            }
            Self::Characters => {
                r#"{"characters": [{"name": <string>, "species": <string>, "role": <string>, "physical_traits": [<string>], "personality_traits": [<string>], "strengths": [<string>], "weaknesses": [<string>], "motivations": <string>, "goals": <string>, "relationships": <string or null>}, 1-6 items]}"#
            }
            Self::Plot => {
                r#"{"setup": <string>, "conflict": <string>, "rising_action": [<string>, ...], "climax": <string>, "resolution": <string>, "themes": [<string>, ...], "episode_hook": <string or null>}"#
            }
            Self::Story => {
                r#"{"title": <string>, "text": <string, at least 100 characters>, "word_count": <int >= 50>, "estimated_reading_time_minutes": <int >= 1>, "tone": <string>, "reading_level": <string>}"#
            }
            Self::Critique => {
                r#"{"verdict": "APPROVED" or "REVISE", "feedback": <string, required when REVISE, omitted when APPROVED>}"#
            }
            Self::Answer => r#"{"text": <string>}"#,
            Self::Routing => {
                r#"{"decision": "NEW_STORY" or "EDIT_STORY" or "QUESTION", "confidence": <float 0-1 or null>}"#
            }
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.schema_name())
    }
}

/// A validated, immutable structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    Intent(UserIntent),
    World(World),
    Characters(CharacterRoster),
    Plot(Plot),
    Story(Story),
    Critique(Critique),
    Answer(Answer),
    Routing(RoutingOutput),
}

fn decode<T>(value: serde_json::Value) -> Result<T, ArtifactError>
where
    T: Validate + serde::de::DeserializeOwned,
{
    let decoded: T = serde_json::from_value(value).map_err(|e| ArtifactError::Malformed {
        schema: T::SCHEMA,
        reason: e.to_string(),
    })?;
    decoded.validate()?;
    Ok(decoded)
}

impl Artifact {
    /// Decodes and validates a raw generated value against `kind`.
    pub fn parse(kind: ArtifactKind, value: serde_json::Value) -> Result<Self, ArtifactError> {
        Ok(match kind {
            ArtifactKind::Intent => Artifact::Intent(decode(value)?),
            ArtifactKind::World => Artifact::World(decode(value)?),
            ArtifactKind::Characters => Artifact::Characters(decode(value)?),
            ArtifactKind::Plot => Artifact::Plot(decode(value)?),
            ArtifactKind::Story => Artifact::Story(decode(value)?),
            ArtifactKind::Critique => Artifact::Critique(decode(value)?),
            ArtifactKind::Answer => Artifact::Answer(decode(value)?),
            ArtifactKind::Routing => Artifact::Routing(decode(value)?),
        })
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Intent(_) => ArtifactKind::Intent,
            Artifact::World(_) => ArtifactKind::World,
            Artifact::Characters(_) => ArtifactKind::Characters,
            Artifact::Plot(_) => ArtifactKind::Plot,
            Artifact::Story(_) => ArtifactKind::Story,
            Artifact::Critique(_) => ArtifactKind::Critique,
            Artifact::Answer(_) => ArtifactKind::Answer,
            Artifact::Routing(_) => ArtifactKind::Routing,
        }
    }

    /// Re-runs the schema checks on an already constructed artifact.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        match self {
            Artifact::Intent(a) => a.validate(),
            Artifact::World(a) => a.validate(),
            Artifact::Characters(a) => a.validate(),
            Artifact::Plot(a) => a.validate(),
            Artifact::Story(a) => a.validate(),
            Artifact::Critique(a) => a.validate(),
            Artifact::Answer(a) => a.validate(),
            Artifact::Routing(a) => a.validate(),
        }
    }

    /// Fails with [`ArtifactError::KindMismatch`] unless this is a `kind` artifact.
    pub fn expect_kind(&self, kind: ArtifactKind) -> Result<(), ArtifactError> {
        if self.kind() != kind {
            return Err(ArtifactError::KindMismatch {
                expected: kind.schema_name(),
                actual: self.kind().schema_name(),
            });
        }
        Ok(())
    }

    /// The untagged JSON value, as sent to downstream tasks.
    pub fn to_value(&self) -> serde_json::Value {
        let result = match self {
            Artifact::Intent(a) => serde_json::to_value(a),
            Artifact::World(a) => serde_json::to_value(a),
            Artifact::Characters(a) => serde_json::to_value(a),
            Artifact::Plot(a) => serde_json::to_value(a),
            Artifact::Story(a) => serde_json::to_value(a),
            Artifact::Critique(a) => serde_json::to_value(a),
            Artifact::Answer(a) => serde_json::to_value(a),
            Artifact::Routing(a) => serde_json::to_value(a),
        };
        // Plain data structs with string keys always serialize.
        result.unwrap_or(serde_json::Value::Null)
    }

    pub fn as_story(&self) -> Option<&Story> {
        match self {
            Artifact::Story(story) => Some(story),
            _ => None,
        }
    }

    pub fn as_critique(&self) -> Option<&Critique> {
        match self {
            Artifact::Critique(critique) => Some(critique),
            _ => None,
        }
    }

    pub fn as_answer(&self) -> Option<&Answer> {
        match self {
            Artifact::Answer(answer) => Some(answer),
            _ => None,
        }
    }

    pub fn as_routing(&self) -> Option<&RoutingOutput> {
        match self {
            Artifact::Routing(routing) => Some(routing),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_world() {
        let value = json!({
            "name": "NeoTech City 2099",
            "description": "A city of glass towers floating above the clouds.",
            "rules": ["Gravity is 50% weaker"],
            "locations": ["The Floating Market", "Elder's Observatory"],
            "aesthetic": "Neon lights and rain-slicked streets"
        });
        let artifact = Artifact::parse(ArtifactKind::World, value).expect("valid world");
        assert_eq!(artifact.kind(), ArtifactKind::World);
    }

    #[test]
    fn test_parse_malformed_is_distinct_from_bounds() {
        let missing = Artifact::parse(ArtifactKind::Intent, json!({"age": 5}));
        assert!(matches!(missing, Err(ArtifactError::Malformed { .. })));

        let out_of_bounds = Artifact::parse(
            ArtifactKind::Intent,
            json!({
                "age": 0,
                "themes": ["cats"],
                "tone": "calm",
                "genre": "bedtime",
                "length_minutes": 5
            }),
        );
        assert!(matches!(out_of_bounds, Err(ArtifactError::OutOfBounds { .. })));
    }

    #[test]
    fn test_tagged_serialization() {
        let artifact = Artifact::Answer(Answer {
            text: "Because he was brave.".to_string(),
        });
        let json = serde_json::to_value(&artifact).expect("serialize");
        assert_eq!(json["kind"], "answer");
        assert_eq!(json["value"]["text"], "Because he was brave.");
        assert_eq!(artifact.to_value(), json!({"text": "Because he was brave."}));
    }

    #[test]
    fn test_expect_kind() {
        let artifact = Artifact::Critique(Critique::approved());
        assert!(artifact.expect_kind(ArtifactKind::Critique).is_ok());
        assert!(matches!(
            artifact.expect_kind(ArtifactKind::Story),
            Err(ArtifactError::KindMismatch { .. })
        ));
    }
}
