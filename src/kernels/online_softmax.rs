//! Running softmax statistics for tile-wise attention.
//!
//! A state summarizes softmax-weighted values over some subset of keys as
//! (running max, sum of exp(score - max), sum of exp(score - max) * value).
//! Two states over disjoint key subsets merge associatively and commutatively
//! (up to rounding), so tiles can be folded in any order.

/// Softmax statistics over a set of keys for one query row.
#[derive(Clone, Debug, PartialEq)]
pub struct SoftmaxState {
    pub max: f32,
    pub sum: f32,
    pub acc: Vec<f32>,
}

impl SoftmaxState {
    /// The identity element: no keys seen yet.
    pub fn empty(dim: usize) -> Self {
        Self {
            max: f32::NEG_INFINITY,
            sum: 0.0,
            acc: vec![0.0; dim],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max == f32::NEG_INFINITY
    }

    /// Statistics of one tile: `scores[j]` pairs with `values[j * dim..(j + 1) * dim]`.
    pub fn from_tile(scores: &[f32], values: &[f32], dim: usize) -> Self {
        let mut state = Self::empty(dim);
        state.absorb(scores, values);
        state
    }

    /// Fold one tile into this state in place.
    pub fn absorb(&mut self, scores: &[f32], values: &[f32]) {
        let dim = self.acc.len();
        debug_assert_eq!(values.len(), scores.len() * dim);

        let tile_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if tile_max == f32::NEG_INFINITY {
            return;
        }
        let new_max = self.max.max(tile_max);
        self.rescale(new_max);

        for (j, &s) in scores.iter().enumerate() {
            let p = (s - new_max).exp();
            self.sum += p;
            let row = &values[j * dim..(j + 1) * dim];
            for (a, &x) in self.acc.iter_mut().zip(row) {
                *a += p * x;
            }
        }
    }

    /// Merge statistics over a disjoint set of keys.
    pub fn merge(mut self, other: &SoftmaxState) -> Self {
        if other.is_empty() {
            return self;
        }
        let new_max = self.max.max(other.max);
        self.rescale(new_max);

        let factor = (other.max - new_max).exp();
        self.sum += other.sum * factor;
        for (a, &b) in self.acc.iter_mut().zip(&other.acc) {
            *a += b * factor;
        }
        self
    }

    /// log(sum_j exp(score_j)) over the keys seen.
    pub fn logsumexp(&self) -> f32 {
        self.max + self.sum.ln()
    }

    /// Normalized output row; zeros if no key was seen.
    pub fn finish(&self) -> Vec<f32> {
        if self.sum == 0.0 {
            return vec![0.0; self.acc.len()];
        }
        self.acc.iter().map(|a| a / self.sum).collect()
    }

    fn rescale(&mut self, new_max: f32) {
        if self.is_empty() {
            self.max = new_max;
            return;
        }
        let correction = (self.max - new_max).exp();
        self.sum *= correction;
        for a in self.acc.iter_mut() {
            *a *= correction;
        }
        self.max = new_max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dense_softmax(scores: &[f32], values: &[f32], dim: usize) -> Vec<f32> {
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f32 = weights.iter().sum();
        (0..dim)
            .map(|c| {
                weights
                    .iter()
                    .enumerate()
                    .map(|(j, w)| w * values[j * dim + c])
                    .sum::<f32>()
                    / total
            })
            .collect()
    }

    #[test]
    fn test_empty_state_finishes_to_zero() {
        let state = SoftmaxState::empty(3);
        assert_eq!(state.finish(), vec![0.0; 3]);
        assert_eq!(state.clone().merge(&SoftmaxState::empty(3)), state);
    }

    #[test]
    fn test_single_tile_matches_softmax() {
        let scores = [1.0f32, -2.0, 0.5];
        let values = [1.0f32, 0.0, 0.0, 1.0, 2.0, 2.0];
        let out = SoftmaxState::from_tile(&scores, &values, 2).finish();
        let expected = dense_softmax(&scores, &values, 2);
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Folding tiles left to right, right to left, or as a tree agrees with
        /// one dense softmax.
        #[test]
        fn merge_is_order_independent(
            scores in prop::collection::vec(-30.0f32..30.0, 1..48),
            split in 1usize..8,
            dim in 1usize..5,
        ) {
            let values: Vec<f32> = (0..scores.len() * dim)
                .map(|i| ((i * 7919) % 13) as f32 - 6.0)
                .collect();
            let expected = dense_softmax(&scores, &values, dim);

            let tiles: Vec<SoftmaxState> = scores
                .chunks(split)
                .zip(values.chunks(split * dim))
                .map(|(s, v)| SoftmaxState::from_tile(s, v, dim))
                .collect();

            let forward = tiles.iter().fold(SoftmaxState::empty(dim), |acc, t| acc.merge(t));
            let backward = tiles.iter().rev().fold(SoftmaxState::empty(dim), |acc, t| acc.merge(t));
            let (left, right) = tiles.split_at(tiles.len() / 2);
            let tree = left
                .iter()
                .fold(SoftmaxState::empty(dim), |acc, t| acc.merge(t))
                .merge(&right.iter().fold(SoftmaxState::empty(dim), |acc, t| acc.merge(t)));

            for state in [forward, backward, tree] {
                for (a, b) in state.finish().iter().zip(&expected) {
                    prop_assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
                }
            }
        }
    }
}
