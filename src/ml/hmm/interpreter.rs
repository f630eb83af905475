use serde::{Deserialize, Serialize};

use super::features::RETURN_DIM;
use super::gaussian_hmm::HmmParameters;

/// Correspondence between fitted (arbitrary) and canonical state indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap {
    /// `canonical_to_fitted[c]` is the fitted index now labelled `c`
    canonical_to_fitted: Vec<usize>,
}

impl LabelMap {
    pub fn fitted(&self, canonical: usize) -> Option<usize> {
        self.canonical_to_fitted.get(canonical).copied()
    }

    pub fn is_identity(&self) -> bool {
        self.canonical_to_fitted.iter().enumerate().all(|(i, &f)| i == f)
    }
}

/// Relabel states by ascending mean return so index 0 is the bear state and
/// index K-1 the bull state. Equal return means are ordered by the remaining
/// mean columns, so the result never depends on the fitted labels.
pub fn canonicalize(params: &HmmParameters) -> (HmmParameters, LabelMap) {
    let mut order: Vec<usize> = (0..params.n_states()).collect();
    order.sort_by(|&a, &b| {
        let (ma, mb) = (params.means.row(a), params.means.row(b));
        ma[RETURN_DIM].total_cmp(&mb[RETURN_DIM]).then_with(|| {
            ma.iter()
                .zip(mb.iter())
                .enumerate()
                .filter(|(dim, _)| *dim != RETURN_DIM)
                .map(|(_, (x, y))| x.total_cmp(y))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });

    let relabeled = params.permuted(&order);
    (relabeled, LabelMap { canonical_to_fitted: order })
}
