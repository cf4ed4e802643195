//! Optional gate from an external directional scorer
//!
//! The scorer is a collaborator: when it has nothing to say, entries go
//! through unchanged.

use serde::{Deserialize, Serialize};

use super::state_machine::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreCategory {
    #[serde(alias = "buy", alias = "BUY")]
    Buy,
    #[serde(alias = "sell", alias = "SELL")]
    Sell,
    #[serde(alias = "hold", alias = "HOLD")]
    Hold,
}

/// Latest opinion of the scorer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionalScore {
    /// Probability of an up move, in `[0, 1]`
    Probability(f64),
    Category(ScoreCategory),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreGate {
    min_probability: Option<f64>,
}

impl ScoreGate {
    pub fn new(min_probability: Option<f64>) -> Self {
        Self { min_probability }
    }

    /// Long needs `p >= min`, short needs `p <= 1 - min`. A category must
    /// agree with the direction; `Hold` vetoes both.
    pub fn allows(&self, direction: Direction, score: Option<&DirectionalScore>) -> bool {
        match score {
            None => true,
            Some(DirectionalScore::Category(category)) => matches!(
                (category, direction),
                (ScoreCategory::Buy, Direction::Long) | (ScoreCategory::Sell, Direction::Short)
            ),
            Some(DirectionalScore::Probability(p)) => {
                let Some(min) = self.min_probability else {
                    return true;
                };
                if !p.is_finite() {
                    return true;
                }
                match direction {
                    Direction::Long => *p >= min,
                    Direction::Short => *p <= 1.0 - min,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_score_never_blocks() {
        let gate = ScoreGate::new(Some(0.9));
        assert!(gate.allows(Direction::Long, None));
        assert!(gate.allows(Direction::Short, None));
    }

    #[test]
    fn test_probability_threshold() {
        let gate = ScoreGate::new(Some(0.6));
        assert!(gate.allows(Direction::Long, Some(&DirectionalScore::Probability(0.7))));
        assert!(!gate.allows(Direction::Long, Some(&DirectionalScore::Probability(0.5))));
        assert!(gate.allows(Direction::Short, Some(&DirectionalScore::Probability(0.3))));
        assert!(!gate.allows(Direction::Short, Some(&DirectionalScore::Probability(0.5))));

        // No threshold configured: probabilities are informational only
        let open = ScoreGate::new(None);
        assert!(open.allows(Direction::Long, Some(&DirectionalScore::Probability(0.0))));
    }

    #[test]
    fn test_category() {
        let gate = ScoreGate::default();
        let buy = DirectionalScore::Category(ScoreCategory::Buy);
        let hold = DirectionalScore::Category(ScoreCategory::Hold);
        assert!(gate.allows(Direction::Long, Some(&buy)));
        assert!(!gate.allows(Direction::Short, Some(&buy)));
        assert!(!gate.allows(Direction::Long, Some(&hold)));
        assert!(!gate.allows(Direction::Short, Some(&hold)));
    }

    #[test]
    fn test_score_deserialize() {
        let score: DirectionalScore = serde_json::from_str(r#"{"category":"sell"}"#).unwrap();
        assert_eq!(score, DirectionalScore::Category(ScoreCategory::Sell));
        let score: DirectionalScore = serde_json::from_str(r#"{"probability":0.42}"#).unwrap();
        assert_eq!(score, DirectionalScore::Probability(0.42));
    }
}
