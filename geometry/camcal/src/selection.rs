use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

/// How candidate images are drawn during selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Visit candidates in a random order, each at most once.
    #[default]
    WithoutReplacement,
    /// Draw uniformly at random each attempt. The same image may be
    /// evaluated more than once.
    WithReplacement,
    /// Visit candidates in sorted order.
    Exhaustive,
}

impl std::str::FromStr for SelectionStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "without-replacement" => Ok(Self::WithoutReplacement),
            "with-replacement" => Ok(Self::WithReplacement),
            "exhaustive" => Ok(Self::Exhaustive),
            other => Err(format!(
                "unknown selection strategy \"{other}\" (expected without-replacement, with-replacement or exhaustive)"
            )),
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::WithoutReplacement => "without-replacement",
            Self::WithReplacement => "with-replacement",
            Self::Exhaustive => "exhaustive",
        };
        f.write_str(s)
    }
}

impl SelectionStrategy {
    /// Indices into the candidate list, one per attempt, never more than
    /// `budget`.
    pub(crate) fn attempt_order<R: Rng>(
        &self,
        n_candidates: usize,
        budget: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        if n_candidates == 0 {
            return vec![];
        }
        match self {
            Self::WithoutReplacement => {
                let mut order: Vec<usize> = (0..n_candidates).collect();
                order.shuffle(rng);
                order.truncate(budget);
                order
            }
            Self::WithReplacement => (0..budget)
                .map(|_| rng.random_range(0..n_candidates))
                .collect(),
            Self::Exhaustive => (0..n_candidates.min(budget)).collect(),
        }
    }
}
