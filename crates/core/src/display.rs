//! Presentation models derived from the current score map.
//!
//! Nothing here draws; these are the numbers a renderer needs for the ranked list, the fixed
//! level bars, the radar and the dominant-emotion timeline.

use crate::emotion::{color, descriptor, EmotionScoreMap};
use crate::protocol::AnalysisMode;
use crate::util::RingBuffer;
use serde::Serialize;
use std::time::Duration;

pub const TOP_EMOTIONS: usize = 7;
pub const TIMELINE_POINTS: usize = 8;
pub const TIMELINE_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

const FACE_LEVELS: [&str; 10] = [
    "Amusement",
    "Anger",
    "Awe",
    "Boredom",
    "Calmness",
    "Contempt",
    "Disgust",
    "Joy",
    "Sadness",
    "Tiredness",
];

const BURST_LEVELS: [&str; 10] = [
    "Anger",
    "Anxiety",
    "Craving",
    "Distress",
    "Ecstasy",
    "Excitement",
    "Fear",
    "Horror",
    "Relief",
    "Triumph",
];

const PROSODY_LEVELS: [&str; 10] = [
    "Admiration",
    "Calmness",
    "Concentration",
    "Determination",
    "Empathic Pain",
    "Interest",
    "Realization",
    "Sadness",
    "Satisfaction",
    "Contemplation",
];

pub fn level_group(mode: AnalysisMode) -> &'static [&'static str] {
    match mode {
        AnalysisMode::Face => &FACE_LEVELS,
        AnalysisMode::Burst => &BURST_LEVELS,
        AnalysisMode::Prosody => &PROSODY_LEVELS,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Level {
    pub name: &'static str,
    /// `score * 100`, clamped to 0..=100.
    pub percent: f64,
}

/// Bars for the mode's fixed group; a name absent from `scores` reads as 0.
pub fn levels(mode: AnalysisMode, scores: Option<&EmotionScoreMap>) -> Vec<Level> {
    level_group(mode)
        .iter()
        .map(|&name| {
            let score = scores.and_then(|s| s.get(name)).unwrap_or(0.0);
            Level {
                name,
                percent: (score * 100.0).clamp(0.0, 100.0),
            }
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedEmotion {
    pub rank: usize,
    pub name: String,
    pub score: f64,
    pub descriptor: Option<&'static str>,
    pub color: Option<&'static str>,
}

impl RankedEmotion {
    pub fn score_text(&self) -> String {
        format!("{:.2}", self.score)
    }
}

pub fn top_emotions(scores: &EmotionScoreMap, n: usize) -> Vec<RankedEmotion> {
    scores
        .top(n)
        .into_iter()
        .enumerate()
        .map(|(i, (name, score))| RankedEmotion {
            rank: i + 1,
            name: name.to_owned(),
            score,
            descriptor: descriptor(name),
            color: color(name),
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RadarPoint {
    pub axis: String,
    /// Within the radius domain `[0, 1]`.
    pub value: f64,
}

pub fn radar(scores: &EmotionScoreMap) -> Vec<RadarPoint> {
    scores
        .top(TOP_EMOTIONS)
        .into_iter()
        .map(|(name, score)| RadarPoint {
            axis: name.to_owned(),
            value: score.clamp(0.0, 1.0),
        })
        .collect()
}

/// A text bar `fraction` of `width` cells long.
pub fn bar(fraction: f64, width: usize) -> String {
    let filled = (fraction.clamp(0.0, 1.0) * width as f64).round() as usize;
    let mut out = "#".repeat(filled);
    out.push_str(&".".repeat(width.saturating_sub(filled)));
    out
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelinePoint {
    /// Time since the timeline started.
    pub at: Duration,
    pub name: String,
    pub score: f64,
}

/// The dominant emotion sampled on a fixed period, last [`TIMELINE_POINTS`] kept.
#[derive(Clone, Debug)]
pub struct DominantTimeline {
    points: RingBuffer<TimelinePoint>,
}

impl Default for DominantTimeline {
    fn default() -> Self {
        Self::new(TIMELINE_POINTS)
    }
}

impl DominantTimeline {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: RingBuffer::new(capacity),
        }
    }

    /// Records the dominant emotion at `at`. Nothing is recorded without scores.
    pub fn sample(&mut self, at: Duration, scores: Option<&EmotionScoreMap>) -> bool {
        let Some((name, score)) = scores.and_then(|s| s.dominant()) else {
            return false;
        };
        self.points.push(TimelinePoint {
            at,
            name: name.to_owned(),
            score,
        });
        true
    }

    pub fn points(&self) -> Vec<&TimelinePoint> {
        self.points.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExpressionChange {
    pub at: Duration,
    pub name: String,
    pub score: f64,
}

/// History of dominant-emotion changes.
#[derive(Clone, Debug, Default)]
pub struct ExpressionTracker {
    history: Vec<ExpressionChange>,
}

impl ExpressionTracker {
    /// Appends an entry only if the dominant emotion differs from the last one recorded.
    pub fn observe(&mut self, at: Duration, scores: &EmotionScoreMap) -> Option<&ExpressionChange> {
        let (name, score) = scores.dominant()?;
        if self.history.last().is_some_and(|last| last.name == name) {
            return None;
        }
        self.history.push(ExpressionChange {
            at,
            name: name.to_owned(),
            score,
        });
        self.history.last()
    }

    pub fn history(&self) -> &[ExpressionChange] {
        &self.history
    }

    pub fn current(&self) -> Option<&ExpressionChange> {
        self.history.last()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, f64)]) -> EmotionScoreMap {
        entries
            .iter()
            .map(|(n, s)| ((*n).to_owned(), *s))
            .collect()
    }

    #[test]
    fn level_groups_have_ten_names() {
        for mode in AnalysisMode::ALL {
            assert_eq!(level_group(mode).len(), 10, "{mode}");
        }
        assert!(level_group(AnalysisMode::Burst).contains(&"Triumph"));
    }

    #[test]
    fn levels_default_missing_names_to_zero() {
        let scores = map(&[("Joy", 0.8), ("Awe", 1.4)]);
        let bars = levels(AnalysisMode::Face, Some(&scores));
        let joy = bars.iter().find(|l| l.name == "Joy").expect("joy bar");
        assert!((joy.percent - 80.0).abs() < 1e-9);
        let awe = bars.iter().find(|l| l.name == "Awe").expect("awe bar");
        assert_eq!(awe.percent, 100.0);
        let anger = bars.iter().find(|l| l.name == "Anger").expect("anger bar");
        assert_eq!(anger.percent, 0.0);

        assert!(levels(AnalysisMode::Prosody, None)
            .iter()
            .all(|l| l.percent == 0.0));
    }

    #[test]
    fn top_emotions_ranked_with_descriptors() {
        let scores = map(&[
            ("Joy", 0.8),
            ("Calmness", 0.2),
            ("Anger", 0.05),
            ("Awe", 0.4),
            ("Boredom", 0.1),
            ("Sadness", 0.3),
            ("Tiredness", 0.01),
            ("Disgust", 0.02),
        ]);
        let top = top_emotions(&scores, TOP_EMOTIONS);
        assert_eq!(top.len(), 7);
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[0].name, "Joy");
        assert_eq!(top[0].score_text(), "0.80");
        assert_eq!(top[0].descriptor, Some("Joyful"));
        assert!(top[0].color.is_some());
        assert_eq!(top[1].name, "Awe");
        assert!(top.iter().all(|e| e.name != "Tiredness"));
    }

    #[test]
    fn radar_clamps_to_unit_domain() {
        let scores = map(&[("Joy", 1.2), ("Anger", -0.1)]);
        let points = radar(&scores);
        assert_eq!(points[0].value, 1.0);
        assert_eq!(points[1].value, 0.0);
    }

    #[test]
    fn bar_rendering() {
        assert_eq!(bar(0.5, 10), "#####.....");
        assert_eq!(bar(2.0, 4), "####");
        assert_eq!(bar(0.0, 3), "...");
    }

    #[test]
    fn timeline_keeps_last_points() {
        let mut timeline = DominantTimeline::default();
        assert!(!timeline.sample(Duration::ZERO, None));

        for i in 0..10u64 {
            let scores = map(&[("Joy", i as f64 / 10.0)]);
            assert!(timeline.sample(Duration::from_secs(i), Some(&scores)));
        }
        let points = timeline.points();
        assert_eq!(points.len(), TIMELINE_POINTS);
        assert_eq!(points[0].at, Duration::from_secs(2));
        assert_eq!(points[7].at, Duration::from_secs(9));

        timeline.clear();
        assert!(timeline.is_empty());
    }

    #[test]
    fn tracker_records_only_changes() {
        let mut tracker = ExpressionTracker::default();
        let joy = map(&[("Joy", 0.8), ("Anger", 0.1)]);
        let joy_again = map(&[("Joy", 0.6), ("Anger", 0.3)]);
        let anger = map(&[("Joy", 0.2), ("Anger", 0.7)]);

        assert!(tracker.observe(Duration::from_secs(0), &joy).is_some());
        assert!(tracker.observe(Duration::from_secs(1), &joy_again).is_none());
        let change = tracker
            .observe(Duration::from_secs(2), &anger)
            .expect("dominant changed");
        assert_eq!(change.name, "Anger");
        assert_eq!(tracker.history().len(), 2);
        assert!(tracker.observe(Duration::from_secs(3), &EmotionScoreMap::default()).is_none());

        tracker.reset();
        assert!(tracker.current().is_none());
    }
}
