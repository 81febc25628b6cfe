//! Wire types for the streaming models endpoint.
//!
//! Outbound frames are JSON text of the form
//! `{"data": "<base64>", "models": {"<mode>": {}}}`. Inbound frames are keyed by the same
//! model names, each carrying either `predictions` or a `warning`.

use crate::emotion::{EmotionScore, EmotionScoreMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Face,
    Burst,
    Prosody,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 3] = [AnalysisMode::Face, AnalysisMode::Burst, AnalysisMode::Prosody];

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::Face => "face",
            AnalysisMode::Burst => "burst",
            AnalysisMode::Prosody => "prosody",
        }
    }

    /// Burst and prosody both analyse microphone audio; face analyses video frames.
    pub fn is_audio(self) -> bool {
        !matches!(self, AnalysisMode::Face)
    }

    pub fn label(self) -> &'static str {
        match self {
            AnalysisMode::Face => "Facial expression",
            AnalysisMode::Burst => "Vocal Burst",
            AnalysisMode::Prosody => "Speech Prosody",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            AnalysisMode::Face => {
                "Explore the diverse facial expressions that convey distinct meanings"
            }
            AnalysisMode::Burst => {
                "These are non-linguistic vocal utterances, including laughs, sighs, oohs, ahhs, umms, gasps, and groans."
            }
            AnalysisMode::Prosody => {
                "Speech prosody is not about the words you say, but the way you say them."
            }
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "face" => Ok(AnalysisMode::Face),
            "burst" => Ok(AnalysisMode::Burst),
            "prosody" => Ok(AnalysisMode::Prosody),
            other => Err(ProtocolError::UnknownMode(other.to_owned())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown analysis mode: {0:?} (expected face, burst or prosody)")]
    UnknownMode(String),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-model options. The service accepts an empty object for defaults.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OutboundPayload {
    pub data: String,
    pub models: BTreeMap<AnalysisMode, ModelConfig>,
}

impl OutboundPayload {
    pub fn new(mode: AnalysisMode, data: String) -> Self {
        let mut models = BTreeMap::new();
        models.insert(mode, ModelConfig::default());
        Self { data, models }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Prediction {
    #[serde(default)]
    pub emotions: Vec<EmotionScore>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ModelReply {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    #[serde(default)]
    pub warning: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct InboundMessage {
    #[serde(default)]
    pub face: Option<ModelReply>,
    #[serde(default)]
    pub burst: Option<ModelReply>,
    #[serde(default)]
    pub prosody: Option<ModelReply>,
    /// Top-level failure reported by the service (bad payload, auth, quota).
    #[serde(default)]
    pub error: Option<String>,
}

/// What a reply means for the request it answers.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplyOutcome {
    Scores(EmotionScoreMap),
    Warning(String),
    /// The reply only carries results for other models.
    Stale,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn reply_for(&self, mode: AnalysisMode) -> Option<&ModelReply> {
        match mode {
            AnalysisMode::Face => self.face.as_ref(),
            AnalysisMode::Burst => self.burst.as_ref(),
            AnalysisMode::Prosody => self.prosody.as_ref(),
        }
    }

    pub fn modes(&self) -> impl Iterator<Item = AnalysisMode> + '_ {
        AnalysisMode::ALL
            .into_iter()
            .filter(move |m| self.reply_for(*m).is_some())
    }

    pub fn outcome_for(&self, mode: AnalysisMode) -> ReplyOutcome {
        if let Some(reply) = self.reply_for(mode) {
            return match reply.predictions.first() {
                Some(first) => ReplyOutcome::Scores(EmotionScoreMap::from_scores(&first.emotions)),
                None => ReplyOutcome::Warning(reply.warning.clone().unwrap_or_default()),
            };
        }
        if let Some(error) = &self.error {
            return ReplyOutcome::Warning(error.clone());
        }
        if self.modes().next().is_some() {
            return ReplyOutcome::Stale;
        }
        ReplyOutcome::Warning(String::new())
    }
}
