//! Association statistic between a k-mer's presence pattern and the phenotype.
//!
//! The score is the point-biserial correlation between the presence indicator and the
//! phenotype:
//!
//! ```text
//! r = (M1 - M0) / s * sqrt(n1 * n0) / n
//! ```
//!
//! where `M1`/`M0` are the phenotype means of the present/absent groups, `n1`/`n0`
//! their sizes and `s` the population standard deviation of the phenotype. With
//! `c_i = y_i - mean(y)` this reduces to `r = S1 * sqrt(n / (n1 * n0 * SS))`, where `S1`
//! is the sum of `c_i` over the present group and `SS` the total sum of squares, so a
//! row is scored with one pass over its set bits. The result lies in `[-1, 1]`, grows
//! with the mean difference relative to the spread, and its sign gives the direction.

use crate::index::PresenceRow;
use crate::phenotype::PhenotypeVector;

#[derive(Debug, Clone)]
pub struct AssociationScorer {
    centered: Vec<f64>,
    sum_squares: f64,
}

impl AssociationScorer {
    pub fn new(phenotypes: &PhenotypeVector) -> Self {
        let values = phenotypes.values();
        let n = values.len();
        let mean = if n == 0 {
            0.0
        } else {
            values.iter().sum::<f64>() / n as f64
        };
        let centered: Vec<f64> = values.iter().map(|v| v - mean).collect();
        let sum_squares = centered.iter().map(|c| c * c).sum();
        Self {
            centered,
            sum_squares,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.centered.len()
    }

    /// Scores one presence row. Returns `None` when the row carries no information:
    /// the k-mer is present in every sample or in none, or the phenotype is constant.
    pub fn score(&self, row: &PresenceRow) -> Option<f64> {
        debug_assert_eq!(row.n_samples(), self.centered.len());
        let n = self.centered.len();
        let present = row.count_present();
        let absent = n - present;
        if present == 0 || absent == 0 || self.sum_squares <= 0.0 {
            return None;
        }

        let group_sum: f64 = row.present_columns().map(|i| self.centered[i]).sum();
        let r = group_sum
            * (n as f64 / (present as f64 * absent as f64 * self.sum_squares)).sqrt();
        Some(r.clamp(-1.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn phenotypes(values: &[f64]) -> PhenotypeVector {
        PhenotypeVector::from_pairs(
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| (format!("s{i}"), v)),
        )
        .unwrap()
    }

    #[test]
    fn perfect_split_scores_one() {
        let scorer = AssociationScorer::new(&phenotypes(&[1.0, 1.0, 0.0, 0.0]));
        let row = PresenceRow::from_bools(&[true, true, false, false]);
        assert_relative_eq!(scorer.score(&row).unwrap(), 1.0, epsilon = 1e-12);
        let flipped = PresenceRow::from_bools(&[false, false, true, true]);
        assert_relative_eq!(scorer.score(&flipped).unwrap(), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn uniform_rows_are_non_informative() {
        for values in [[0.3, -1.0, 2.0, 5.5], [1.0, 1.0, 0.0, 0.0]] {
            let scorer = AssociationScorer::new(&phenotypes(&values));
            assert_eq!(scorer.score(&PresenceRow::from_bools(&[true; 4])), None);
            assert_eq!(scorer.score(&PresenceRow::from_bools(&[false; 4])), None);
        }
    }

    #[test]
    fn constant_phenotype_is_non_informative() {
        let scorer = AssociationScorer::new(&phenotypes(&[2.0, 2.0, 2.0]));
        assert_eq!(scorer.score(&PresenceRow::from_bools(&[true, false, false])), None);
    }

    #[test]
    fn matches_pearson_correlation_with_indicator() {
        let values = [3.1, -0.4, 2.2, 0.9, 5.0, 1.7, -2.3];
        let calls = [true, false, true, false, true, false, false];
        let scorer = AssociationScorer::new(&phenotypes(&values));
        let score = scorer.score(&PresenceRow::from_bools(&calls)).unwrap();

        let x: Vec<f64> = calls.iter().map(|&c| if c { 1.0 } else { 0.0 }).collect();
        let n = values.len() as f64;
        let mx = x.iter().sum::<f64>() / n;
        let my = values.iter().sum::<f64>() / n;
        let cov: f64 = x.iter().zip(&values).map(|(a, b)| (a - mx) * (b - my)).sum();
        let vx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
        let vy: f64 = values.iter().map(|b| (b - my).powi(2)).sum();
        assert_relative_eq!(score, cov / (vx * vy).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn magnitude_grows_with_mean_difference() {
        let scorer = AssociationScorer::new(&phenotypes(&[4.0, 3.0, 2.0, 1.0, 0.0, -1.0]));
        let strong = scorer
            .score(&PresenceRow::from_bools(&[true, true, true, false, false, false]))
            .unwrap();
        let weak = scorer
            .score(&PresenceRow::from_bools(&[true, false, true, false, true, false]))
            .unwrap();
        assert!(strong.abs() > weak.abs());
        assert!(strong > 0.0);
    }

    #[test]
    fn score_is_invariant_to_sample_order() {
        let a = AssociationScorer::new(&phenotypes(&[0.5, 2.0, -1.0, 3.0, 0.0]));
        let row_a = PresenceRow::from_bools(&[true, false, false, true, false]);
        let b = AssociationScorer::new(&phenotypes(&[3.0, 0.0, 0.5, -1.0, 2.0]));
        let row_b = PresenceRow::from_bools(&[true, false, true, false, false]);
        assert_relative_eq!(
            a.score(&row_a).unwrap(),
            b.score(&row_b).unwrap(),
            epsilon = 1e-12
        );
    }
}
