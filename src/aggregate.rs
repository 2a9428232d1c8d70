//! Label aggregation.

use crate::schemas::{AddressLabel, PrimaryLabel};

/// Collapses provider labels into one primary answer.
pub trait LabelAggregator: Send + Sync {
    /// `labels` are in fan-out order.
    fn aggregate(&self, labels: &[AddressLabel]) -> PrimaryLabel;
}

/// Highest confidence wins; among equal confidences the earliest label in fan-out order wins.
/// No labels yields the neutral prior (unknown / unknown / 0.5).
#[derive(Debug, Default, Clone, Copy)]
pub struct HighestConfidence;

impl LabelAggregator for HighestConfidence {
    fn aggregate(&self, labels: &[AddressLabel]) -> PrimaryLabel {
        labels
            .iter()
            .fold(None::<&AddressLabel>, |best, label| match best {
                Some(b) if b.confidence >= label.confidence => Some(b),
                _ => Some(label),
            })
            .map(PrimaryLabel::from)
            .unwrap_or_else(PrimaryLabel::neutral)
    }
}
