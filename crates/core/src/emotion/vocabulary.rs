/// The fixed vocabulary the expression models score against.
pub const CANONICAL_EMOTION_NAMES: [&str; 48] = [
    "Admiration",
    "Adoration",
    "Aesthetic Appreciation",
    "Amusement",
    "Anger",
    "Anxiety",
    "Awe",
    "Awkwardness",
    "Boredom",
    "Calmness",
    "Concentration",
    "Confusion",
    "Contemplation",
    "Contempt",
    "Contentment",
    "Craving",
    "Desire",
    "Determination",
    "Disappointment",
    "Disgust",
    "Distress",
    "Doubt",
    "Ecstasy",
    "Embarrassment",
    "Empathic Pain",
    "Entrancement",
    "Envy",
    "Excitement",
    "Fear",
    "Guilt",
    "Horror",
    "Interest",
    "Joy",
    "Love",
    "Nostalgia",
    "Pain",
    "Pride",
    "Realization",
    "Relief",
    "Romance",
    "Sadness",
    "Satisfaction",
    "Shame",
    "Surprise (negative)",
    "Surprise (positive)",
    "Sympathy",
    "Tiredness",
    "Triumph",
];

const DESCRIPTORS: [(&str, Option<&str>); 48] = [
    ("Admiration", Some("Admiring")),
    ("Adoration", Some("Adoring")),
    ("Aesthetic Appreciation", None),
    ("Amusement", Some("Amused")),
    ("Anger", Some("Angry")),
    ("Anxiety", Some("Anxious")),
    ("Awe", None),
    ("Awkwardness", Some("Awkward")),
    ("Boredom", Some("Bored")),
    ("Calmness", Some("Calm")),
    ("Concentration", None),
    ("Confusion", Some("Confused")),
    ("Contemplation", Some("Contemplative")),
    ("Contempt", Some("Contemptful")),
    ("Contentment", Some("Contented")),
    ("Craving", Some("Craving")),
    ("Desire", Some("Desirous")),
    ("Determination", Some("Determined")),
    ("Disappointment", Some("Disappointed")),
    ("Disgust", Some("Disgusted")),
    ("Distress", Some("Distressed")),
    ("Doubt", Some("Doubtful")),
    ("Ecstasy", Some("Ecstatic")),
    ("Embarrassment", Some("Embarrassed")),
    ("Empathic Pain", None),
    ("Entrancement", Some("Entranced")),
    ("Envy", Some("Envious")),
    ("Excitement", Some("Excited")),
    ("Fear", Some("Fearful")),
    ("Guilt", Some("Guilty")),
    ("Horror", Some("Horrified")),
    ("Interest", Some("Interested")),
    ("Joy", Some("Joyful")),
    ("Love", Some("Loving")),
    ("Nostalgia", Some("Nostalgic")),
    ("Pain", Some("Pained")),
    ("Pride", Some("Prideful")),
    ("Realization", None),
    ("Relief", Some("Relieved")),
    ("Romance", Some("Romantic")),
    ("Sadness", Some("Sad")),
    ("Satisfaction", Some("Satisfied")),
    ("Shame", Some("Shameful")),
    ("Surprise (negative)", Some("Surprised")),
    ("Surprise (positive)", Some("Surprised")),
    ("Sympathy", Some("Sympathetic")),
    ("Tiredness", Some("Tired")),
    ("Triumph", Some("Triumphant")),
];

const COLORS: [(&str, &str); 48] = [
    ("Admiration", "#ffc58f"),
    ("Adoration", "#ffc6cc"),
    ("Aesthetic Appreciation", "#e2cbff"),
    ("Amusement", "#febf52"),
    ("Anger", "#b21816"),
    ("Anxiety", "#6e42cc"),
    ("Awe", "#7dabd3"),
    ("Awkwardness", "#d7d99d"),
    ("Boredom", "#a4a4a4"),
    ("Calmness", "#a9cce1"),
    ("Concentration", "#336cff"),
    ("Confusion", "#c66a26"),
    ("Contemplation", "#b0aeef"),
    ("Contempt", "#76842d"),
    ("Contentment", "#e5c6b4"),
    ("Craving", "#54591c"),
    ("Desire", "#aa0d59"),
    ("Determination", "#ff5c00"),
    ("Disappointment", "#006c7c"),
    ("Disgust", "#1a7a41"),
    ("Distress", "#c5f264"),
    ("Doubt", "#998644"),
    ("Ecstasy", "#ff48a4"),
    ("Embarrassment", "#63c653"),
    ("Empathic Pain", "#ca5555"),
    ("Entrancement", "#7554d6"),
    ("Envy", "#1d4921"),
    ("Excitement", "#fff974"),
    ("Fear", "#d1c9ef"),
    ("Guilt", "#879aa1"),
    ("Horror", "#772e7a"),
    ("Interest", "#a9cce1"),
    ("Joy", "#ffd600"),
    ("Love", "#f44f4c"),
    ("Nostalgia", "#b087a1"),
    ("Pain", "#8c1d1d"),
    ("Pride", "#9a4cb6"),
    ("Realization", "#217aa8"),
    ("Relief", "#fe927a"),
    ("Romance", "#f0cc86"),
    ("Sadness", "#305575"),
    ("Satisfaction", "#a6ddaf"),
    ("Shame", "#8a6262"),
    ("Surprise (negative)", "#70e63a"),
    ("Surprise (positive)", "#7affff"),
    ("Sympathy", "#7f88e0"),
    ("Tiredness", "#757575"),
    ("Triumph", "#ec8132"),
];

pub fn is_canonical(name: &str) -> bool {
    CANONICAL_EMOTION_NAMES.contains(&name)
}

/// Adjective form, e.g. "Joy" -> "Joyful". Some categories have none.
pub fn descriptor(name: &str) -> Option<&'static str> {
    DESCRIPTORS
        .iter()
        .find(|(n, _)| *n == name)
        .and_then(|(_, d)| *d)
}

/// Hex display colour for a category.
pub fn color(name: &str) -> Option<&'static str> {
    COLORS.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_cover_every_canonical_name() {
        for (i, name) in CANONICAL_EMOTION_NAMES.iter().enumerate() {
            assert_eq!(DESCRIPTORS[i].0, *name);
            assert_eq!(COLORS[i].0, *name);
            assert!(color(name).is_some());
        }
    }

    #[test]
    fn descriptor_lookup() {
        assert_eq!(descriptor("Joy"), Some("Joyful"));
        assert_eq!(descriptor("Awe"), None);
        assert_eq!(descriptor("Neutral"), None);
        assert!(is_canonical("Surprise (positive)"));
        assert!(!is_canonical("Neutral"));
    }
}
