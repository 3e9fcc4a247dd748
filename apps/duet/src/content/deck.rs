use duet_proto::{ChallengeKind, Intensity};
use rand::seq::SliceRandom;
use rand::Rng;

const FRIENDLY_TRUTHS: &[&str] = &[
    "What was your very first impression of me?",
    "Which of our shared memories makes you laugh the most?",
    "What is a small habit of mine you secretly love?",
    "If we swapped lives for a day, what would you do first?",
    "What song always reminds you of us?",
];

const FRIENDLY_DARES: &[&str] = &[
    "Do your best impression of me for thirty seconds.",
    "Sing the chorus of our favourite song.",
    "Show the last photo you took and explain it.",
    "Talk in a pirate accent until your next turn.",
    "Draw a portrait of me in under a minute.",
];

const ROMANTIC_TRUTHS: &[&str] = &[
    "When did you first realise you had feelings for me?",
    "What is your favourite thing about our future together?",
    "Which date of ours would you relive tomorrow?",
    "What do I do that makes you feel most loved?",
    "Where would you take me for a perfect weekend?",
];

const ROMANTIC_DARES: &[&str] = &[
    "Write a three-line love poem and read it aloud.",
    "Describe our dream home in detail.",
    "Tell me three things you adore about me while holding eye contact.",
    "Plan our next date in sixty seconds.",
    "Recreate the moment we first met.",
];

const HOT_TRUTHS: &[&str] = &[
    "What outfit of mine do you find hardest to resist?",
    "Where is the most daring place you have wanted to kiss me?",
    "What is one thing I do that instantly turns you on?",
    "Describe your favourite memory of us getting close.",
    "What is a fantasy you have never told me about?",
];

const HOT_DARES: &[&str] = &[
    "Whisper something teasing you want to do later.",
    "Give your best slow, flirty look into the camera.",
    "Describe how you would kiss me right now.",
    "Send me a voice note that is as flirty as you dare.",
    "Show me your best seductive dance move.",
];

const VERY_HOT_TRUTHS: &[&str] = &[
    "What is the boldest fantasy you want us to try?",
    "What is the most intimate thing you crave from me?",
    "Which of our nights together do you replay most often?",
    "What would you want me to do if we had no limits tonight?",
    "What do you want me to wear next time, if anything?",
];

const VERY_HOT_DARES: &[&str] = &[
    "Describe in detail what you would do if I were next to you.",
    "Tell me exactly where you want to be touched.",
    "Give me a private show for thirty seconds.",
    "Narrate your ideal night with me, step by step.",
    "Say the boldest thing you have ever wanted to say to me.",
];

/// Built-in questions, used when nothing is typed or generation fails.
pub struct QuestionDeck;

impl QuestionDeck {
    pub fn all(intensity: Intensity, kind: ChallengeKind) -> &'static [&'static str] {
        match (intensity, kind) {
            (Intensity::Friendly, ChallengeKind::Truth) => FRIENDLY_TRUTHS,
            (Intensity::Friendly, ChallengeKind::Dare) => FRIENDLY_DARES,
            (Intensity::Romantic, ChallengeKind::Truth) => ROMANTIC_TRUTHS,
            (Intensity::Romantic, ChallengeKind::Dare) => ROMANTIC_DARES,
            (Intensity::Hot, ChallengeKind::Truth) => HOT_TRUTHS,
            (Intensity::Hot, ChallengeKind::Dare) => HOT_DARES,
            (Intensity::VeryHot, ChallengeKind::Truth) => VERY_HOT_TRUTHS,
            (Intensity::VeryHot, ChallengeKind::Dare) => VERY_HOT_DARES,
        }
    }

    pub fn first(intensity: Intensity, kind: ChallengeKind) -> &'static str {
        Self::all(intensity, kind)[0]
    }

    pub fn random<R: Rng + ?Sized>(intensity: Intensity, kind: ChallengeKind, rng: &mut R) -> &'static str {
        Self::all(intensity, kind)
            .choose(rng)
            .copied()
            .unwrap_or_else(|| Self::first(intensity, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_level_and_kind_has_questions() {
        for intensity in Intensity::ALL {
            for kind in [ChallengeKind::Truth, ChallengeKind::Dare] {
                assert!(!QuestionDeck::all(intensity, kind).is_empty());
            }
        }
    }

    #[test]
    fn random_draws_from_the_matching_table() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let question = QuestionDeck::random(Intensity::Hot, ChallengeKind::Dare, &mut rng);
            assert!(HOT_DARES.contains(&question));
        }
    }
}
