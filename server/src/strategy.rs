//! Allocation of imposed strategies across groups
//!
//! A distribution is a quota table: each strategy is imposed on exactly as
//! many groups as its count. Which groups receive which strategy is a uniform
//! random permutation drawn from the caller's random source.

use crate::error::{Result, ServerError};
use crate::group::GroupId;
use rand::seq::SliceRandom;
use rand::Rng;
use shared::Strategy;
use std::collections::BTreeMap;

/// Strategy to number of groups it is imposed on. Iterated in strategy order.
pub type StrategyDistribution = BTreeMap<Strategy, usize>;

/// Checks a distribution against the number of groups available.
///
/// The running total is compared after each entry, so the error names the
/// first count that no longer fits. Returns the total number of impositions.
pub fn validate(distribution: &StrategyDistribution, number_of_groups: usize) -> Result<usize> {
    if distribution.is_empty() {
        return Err(ServerError::EmptyStrategyDistribution);
    }
    let mut strategies = 0;
    for occurrences in distribution.values() {
        strategies += occurrences;
        if strategies > number_of_groups {
            return Err(ServerError::StrategyQuotaExceeded {
                strategies,
                groups: number_of_groups,
            });
        }
    }
    Ok(strategies)
}

/// Shuffles `ordered_groups` and walks the shuffled list handing out each
/// strategy `occurrences` times.
///
/// Returns every group in shuffled order paired with its imposed strategy;
/// groups past the total quota are paired with `None`. Nothing is assigned if
/// validation fails.
pub fn allocate<R: Rng + ?Sized>(
    ordered_groups: &[GroupId],
    distribution: &StrategyDistribution,
    rng: &mut R,
) -> Result<Vec<(GroupId, Option<Strategy>)>> {
    validate(distribution, ordered_groups.len())?;

    let mut shuffled = ordered_groups.to_vec();
    shuffled.shuffle(rng);

    let mut strategies = distribution
        .iter()
        .flat_map(|(strategy, occurrences)| std::iter::repeat(*strategy).take(*occurrences));

    Ok(shuffled
        .into_iter()
        .map(|group| (group, strategies.next()))
        .collect())
}
