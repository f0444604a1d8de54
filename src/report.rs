//! # Aggregate report
//! Pure per-batch summary over analysis results. No I/O; recomputing from the same
//! list always yields the same numbers.

use serde::{Deserialize, Serialize};

use crate::model::AnalyzedItem;

pub const POSITIVE_ABOVE: f64 = 0.6;
pub const NEGATIVE_BELOW: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentClass {
    Positive,
    Neutral,
    Negative,
}

/// Neutral band is inclusive on both ends: [0.4, 0.6].
pub fn classify(score: f64) -> SentimentClass {
    if score > POSITIVE_ABOVE {
        SentimentClass::Positive
    } else if score < NEGATIVE_BELOW {
        SentimentClass::Negative
    } else {
        SentimentClass::Neutral
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub average_sentiment: f64,
    pub distribution: Distribution,
    pub item_count: usize,
}

impl AggregateReport {
    pub fn from_scores<I: IntoIterator<Item = f64>>(scores: I) -> Self {
        let mut dist = Distribution::default();
        let mut sum = 0.0f64;
        let mut n = 0usize;
        for s in scores {
            match classify(s) {
                SentimentClass::Positive => dist.positive += 1,
                SentimentClass::Neutral => dist.neutral += 1,
                SentimentClass::Negative => dist.negative += 1,
            }
            sum += s;
            n += 1;
        }
        let avg = if n > 0 { sum / n as f64 } else { 0.0 };
        Self {
            average_sentiment: avg,
            distribution: dist,
            item_count: n,
        }
    }
}

pub fn compute_report(results: &[AnalyzedItem]) -> AggregateReport {
    AggregateReport::from_scores(results.iter().map(|r| r.analysis.sentiment_score))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_are_inclusive_for_neutral() {
        assert_eq!(classify(0.6), SentimentClass::Neutral);
        assert_eq!(classify(0.4), SentimentClass::Neutral);
        assert_eq!(classify(0.61), SentimentClass::Positive);
        assert_eq!(classify(0.39), SentimentClass::Negative);
    }

    #[test]
    fn average_and_distribution() {
        let r = AggregateReport::from_scores([0.2, 0.5, 0.8, 0.9]);
        assert_eq!(r.item_count, 4);
        assert!((r.average_sentiment - 0.6).abs() < 1e-9);
        assert_eq!(
            r.distribution,
            Distribution {
                positive: 2,
                neutral: 1,
                negative: 1
            }
        );
    }

    #[test]
    fn empty_input_is_zeroed() {
        let r = AggregateReport::from_scores(std::iter::empty());
        assert_eq!(r.item_count, 0);
        assert_eq!(r.average_sentiment, 0.0);
        assert_eq!(r.distribution, Distribution::default());
    }

    #[test]
    fn recomputation_is_stable() {
        let scores = [0.11, 0.4, 0.6, 0.61, 0.99];
        assert_eq!(
            AggregateReport::from_scores(scores),
            AggregateReport::from_scores(scores)
        );
    }
}
