//! Reconciliation of blueprint measurements against OCR text totals.
//!
//! The threshold table is data: the runtime and the test suite both read
//! `RECONCILE_BANDS`, so they cannot drift apart.

use crate::models::{Recommendation, Reconciliation};

/// One reconciliation band: differences up to `max_diff_percent`
/// (exclusive) map to this confidence and recommendation.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileBand {
    pub max_diff_percent: f64,
    pub verification_confidence: f64,
    pub recommendation: Recommendation,
}

/// Authoritative band table, ascending by difference.
pub const RECONCILE_BANDS: [ReconcileBand; 4] = [
    ReconcileBand {
        max_diff_percent: 5.0,
        verification_confidence: 0.95,
        recommendation: Recommendation::UseBlueprint,
    },
    ReconcileBand {
        max_diff_percent: 15.0,
        verification_confidence: 0.80,
        recommendation: Recommendation::UseBlueprint,
    },
    ReconcileBand {
        max_diff_percent: 30.0,
        verification_confidence: 0.60,
        recommendation: Recommendation::ManualReview,
    },
    ReconcileBand {
        max_diff_percent: f64::INFINITY,
        verification_confidence: 0.30,
        recommendation: Recommendation::ManualReview,
    },
];

/// Compare the OCR text total against the blueprint measurement and
/// produce a verdict from the band table.
pub fn verify_measurements(ocr_total_sqft: f64, blueprint_total_sqft: f64) -> Reconciliation {
    let larger = ocr_total_sqft.max(blueprint_total_sqft);
    let diff_percent = if larger > 0.0 {
        (ocr_total_sqft - blueprint_total_sqft).abs() / larger * 100.0
    } else {
        0.0
    };

    let band = RECONCILE_BANDS
        .iter()
        .find(|b| diff_percent < b.max_diff_percent)
        .expect("band table covers all differences");

    Reconciliation {
        ocr_total_sqft,
        blueprint_total_sqft,
        diff_percent,
        verification_confidence: band.verification_confidence,
        recommendation: band.recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries_match_table() {
        let cases = [
            (2500.0, 2500.0, 0.95, Recommendation::UseBlueprint),
            (2450.0, 2500.0, 0.95, Recommendation::UseBlueprint),
            (2300.0, 2500.0, 0.80, Recommendation::UseBlueprint),
            (2000.0, 2500.0, 0.60, Recommendation::ManualReview),
            (1500.0, 2500.0, 0.30, Recommendation::ManualReview),
        ];
        for (ocr, blueprint, confidence, recommendation) in cases {
            let verdict = verify_measurements(ocr, blueprint);
            assert_eq!(
                verdict.verification_confidence, confidence,
                "ocr={ocr} blueprint={blueprint} diff={}",
                verdict.diff_percent
            );
            assert_eq!(verdict.recommendation, recommendation);
        }
    }

    #[test]
    fn test_exact_band_edges() {
        // 5% sits in the second band, 15% in the third, 30% in the last.
        let at = |percent: f64| verify_measurements(100.0 - percent, 100.0);
        assert_eq!(at(4.999).verification_confidence, 0.95);
        assert_eq!(at(5.0).verification_confidence, 0.80);
        assert_eq!(at(15.0).verification_confidence, 0.60);
        assert_eq!(at(30.0).verification_confidence, 0.30);
    }

    #[test]
    fn test_disagreement_case() {
        // OCR says 4,421 while the blueprint measures 2,500.
        let verdict = verify_measurements(4421.0, 2500.0);
        assert_eq!(verdict.recommendation, Recommendation::ManualReview);
        assert_eq!(verdict.verification_confidence, 0.30);
        assert!(verdict.diff_percent > 30.0);
    }

    #[test]
    fn test_symmetry() {
        let a = verify_measurements(2000.0, 2500.0);
        let b = verify_measurements(2500.0, 2000.0);
        assert_eq!(a.diff_percent, b.diff_percent);
        assert_eq!(a.recommendation, b.recommendation);
    }

    #[test]
    fn test_zero_totals_do_not_divide_by_zero() {
        let verdict = verify_measurements(0.0, 0.0);
        assert_eq!(verdict.diff_percent, 0.0);
        assert_eq!(verdict.recommendation, Recommendation::UseBlueprint);
    }
}
