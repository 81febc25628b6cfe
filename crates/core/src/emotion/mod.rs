mod vocabulary;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use vocabulary::{color, descriptor, is_canonical, CANONICAL_EMOTION_NAMES};

/// One `{name, score}` entry as it appears in a prediction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmotionScore {
    pub name: String,
    pub score: f64,
}

/// Latest per-category scores, replaced wholesale on every reply that carries predictions.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EmotionScoreMap {
    scores: BTreeMap<String, f64>,
}

impl EmotionScoreMap {
    /// Later entries win when a name repeats.
    pub fn from_scores<'a, I>(scores: I) -> Self
    where
        I: IntoIterator<Item = &'a EmotionScore>,
    {
        let scores = scores
            .into_iter()
            .map(|s| (s.name.clone(), s.score))
            .collect();
        Self { scores }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.scores.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.scores.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Entries by descending score; ties keep name order.
    pub fn sorted(&self) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> = self.iter().collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1));
        entries
    }

    pub fn top(&self, n: usize) -> Vec<(&str, f64)> {
        let mut sorted = self.sorted();
        sorted.truncate(n);
        sorted
    }

    pub fn dominant(&self) -> Option<(&str, f64)> {
        self.sorted().into_iter().next()
    }
}

impl FromIterator<(String, f64)> for EmotionScoreMap {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self {
            scores: iter.into_iter().collect(),
        }
    }
}
