//! The three propagation tiers as pure functions.
//!
//! Each tier consumes the result of the previous one, so the ordering
//! Tier 3 → Tier 2 → Tier 1 → reduce cannot be violated:
//!
//! ```text
//! tier3(ctx) -> Tier3Result
//! tier2(ctx, Tier3Result) -> Tier2Result
//! tier1(ctx, Tier2Result) -> Tier1Result
//! Tier1Result::reduce() -> Reduced
//! ```
//!
//! Nothing here performs I/O. The caller gathers priors, cluster membership
//! and neighbors up front into a [`RunContext`].

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::graph::Neighbor;
use crate::node::{ClusterId, NodeId};

use super::{AssessmentResult, PropagationConfig, TierCounts};

/// Everything a run needs, fetched before computation starts.
#[derive(Debug)]
pub struct RunContext<'a> {
    pub config: &'a PropagationConfig,
    /// Validated results in caller order.
    pub results: &'a [AssessmentResult],
    /// Cluster of each tested node.
    pub node_clusters: HashMap<NodeId, ClusterId>,
    /// Members of every cluster containing a tested node.
    pub cluster_members: BTreeMap<ClusterId, Vec<NodeId>>,
    /// Qualifying neighbors of each tested node, ordered by `(depth, node)`.
    pub neighbors: HashMap<NodeId, Vec<Neighbor>>,
    /// Stored proficiency before the run.
    pub prior: HashMap<NodeId, f64>,
}

impl RunContext<'_> {
    /// Stored value of a node before the run, or the default.
    pub fn prior(&self, node: NodeId) -> f64 {
        self.prior
            .get(&node)
            .copied()
            .unwrap_or(self.config.default_proficiency)
    }

    fn tested(&self) -> HashSet<NodeId> {
        self.results.iter().map(|r| r.node).collect()
    }
}

/// Cluster baselines for untested members of touched clusters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tier3Result {
    pub cluster_means: BTreeMap<ClusterId, f64>,
    pub baseline: BTreeMap<NodeId, f64>,
}

/// Neighbor adjustments, on top of the Tier 3 baselines.
#[derive(Debug, Clone, PartialEq)]
pub struct Tier2Result {
    pub tier3: Tier3Result,
    pub adjusted: BTreeMap<NodeId, f64>,
    pub steps: usize,
}

/// Direct updates of the tested nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tier1Result {
    pub tier2: Tier2Result,
    pub direct: BTreeMap<NodeId, f64>,
}

/// Merged, clamped output of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduced {
    pub values: BTreeMap<NodeId, f64>,
    pub cluster_means: BTreeMap<ClusterId, f64>,
    pub counts: TierCounts,
}

/// Tier 3: mean score per touched cluster, assigned to its untested members.
pub fn tier3(ctx: &RunContext<'_>) -> Tier3Result {
    let mut sums: BTreeMap<ClusterId, (f64, usize)> = BTreeMap::new();
    for result in ctx.results {
        if let Some(&cluster) = ctx.node_clusters.get(&result.node) {
            let entry = sums.entry(cluster).or_insert((0.0, 0));
            entry.0 += result.score;
            entry.1 += 1;
        }
    }

    let tested = ctx.tested();
    let mut out = Tier3Result::default();
    for (cluster, (sum, count)) in sums {
        let mean = sum / count as f64;
        out.cluster_means.insert(cluster, mean);
        for &member in ctx.cluster_members.get(&cluster).into_iter().flatten() {
            if !tested.contains(&member) {
                out.baseline.insert(member, mean);
            }
        }
    }
    tracing::debug!(
        clusters = out.cluster_means.len(),
        baseline = out.baseline.len(),
        "tier 3 complete"
    );
    out
}

/// Tier 2: `P(B) += alpha_neighbor * W * (score - P(B))` for every qualifying
/// neighbor of every tested node, in caller order. Tested nodes are skipped.
pub fn tier2(ctx: &RunContext<'_>, tier3: Tier3Result) -> Tier2Result {
    let tested = ctx.tested();
    let alpha = ctx.config.alpha_neighbor;
    let mut adjusted: BTreeMap<NodeId, f64> = BTreeMap::new();
    let mut steps = 0;

    for result in ctx.results {
        let Some(neighbors) = ctx.neighbors.get(&result.node) else {
            continue;
        };
        for neighbor in neighbors {
            if tested.contains(&neighbor.node) {
                continue;
            }
            let weight = ctx
                .config
                .effective_weight(neighbor.weight, neighbor.sample_size);
            let current = adjusted
                .get(&neighbor.node)
                .or_else(|| tier3.baseline.get(&neighbor.node))
                .copied()
                .unwrap_or_else(|| ctx.prior(neighbor.node));
            let next = current + alpha * weight * (result.score - current);
            adjusted.insert(neighbor.node, next);
            steps += 1;
        }
    }
    tracing::debug!(adjusted = adjusted.len(), steps, "tier 2 complete");
    Tier2Result {
        tier3,
        adjusted,
        steps,
    }
}

/// Tier 1: `P(A) = P_prior(A) + alpha_direct * (score - P_prior(A))`.
pub fn tier1(ctx: &RunContext<'_>, tier2: Tier2Result) -> Tier1Result {
    let alpha = ctx.config.alpha_direct;
    let direct = ctx
        .results
        .iter()
        .map(|r| {
            let prior = ctx.prior(r.node);
            (r.node, prior + alpha * (r.score - prior))
        })
        .collect();
    Tier1Result { tier2, direct }
}

impl Tier1Result {
    /// Merge the tiers (later tiers win) and clamp every value to [0, 1].
    pub fn reduce(self) -> Reduced {
        let Tier1Result { tier2, direct } = self;
        let Tier2Result {
            tier3,
            adjusted,
            steps,
        } = tier2;

        let counts = TierCounts {
            baseline: tier3.baseline.len(),
            propagated: adjusted.len(),
            neighbor_steps: steps,
            direct: direct.len(),
        };

        let mut values = tier3.baseline;
        values.extend(adjusted);
        values.extend(direct);
        for value in values.values_mut() {
            *value = value.clamp(0.0, 1.0);
        }

        Reduced {
            values,
            cluster_means: tier3.cluster_means,
            counts,
        }
    }
}

/// Run all tiers in order.
pub fn compute(ctx: &RunContext<'_>) -> Reduced {
    let t3 = tier3(ctx);
    let t2 = tier2(ctx, t3);
    tier1(ctx, t2).reduce()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u64) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn neighbor(id: u64, weight: f64, depth: usize) -> Neighbor {
        Neighbor {
            node: n(id),
            weight,
            sample_size: 100,
            depth,
        }
    }

    fn ctx<'a>(config: &'a PropagationConfig, results: &'a [AssessmentResult]) -> RunContext<'a> {
        RunContext {
            config,
            results,
            node_clusters: HashMap::new(),
            cluster_members: BTreeMap::new(),
            neighbors: HashMap::new(),
            prior: HashMap::new(),
        }
    }

    #[test]
    fn single_result_with_one_neighbor() {
        let config = PropagationConfig::default();
        let results = [AssessmentResult::new(n(1), 0.9)];
        let mut c = ctx(&config, &results);
        c.node_clusters.insert(n(1), ClusterId(1));
        c.cluster_members.insert(ClusterId(1), vec![n(1)]);
        c.neighbors.insert(n(1), vec![neighbor(2, 0.8, 1)]);
        c.prior.insert(n(1), 0.4);

        let out = compute(&c);
        assert!((out.values[&n(1)] - 0.45).abs() < 1e-12);
        assert!((out.values[&n(2)] - 0.424).abs() < 1e-12);
        assert_eq!(out.values.len(), 2);
    }

    #[test]
    fn cluster_mean_seeds_untested_members() {
        let config = PropagationConfig::default();
        let results = [
            AssessmentResult::new(n(1), 1.0),
            AssessmentResult::new(n(2), 0.5),
        ];
        let mut c = ctx(&config, &results);
        c.node_clusters.insert(n(1), ClusterId(7));
        c.node_clusters.insert(n(2), ClusterId(7));
        c.cluster_members.insert(ClusterId(7), vec![n(1), n(2), n(3), n(4)]);

        let out = compute(&c);
        assert_eq!(out.cluster_means[&ClusterId(7)], 0.75);
        assert_eq!(out.values[&n(3)], 0.75);
        assert_eq!(out.values[&n(4)], 0.75);
        assert_eq!(out.counts.baseline, 2);
        assert_eq!(out.counts.direct, 2);
    }

    #[test]
    fn neighbor_propagation_starts_from_baseline() {
        let config = PropagationConfig::default();
        let results = [AssessmentResult::new(n(1), 0.2)];
        let mut c = ctx(&config, &results);
        c.node_clusters.insert(n(1), ClusterId(1));
        c.cluster_members.insert(ClusterId(1), vec![n(1), n(2)]);
        c.neighbors.insert(n(1), vec![neighbor(2, 0.5, 1)]);
        c.prior.insert(n(2), 0.9);

        let out = compute(&c);
        // baseline 0.2, score 0.2: no movement, and the stored 0.9 is ignored
        assert!((out.values[&n(2)] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn tested_nodes_depend_only_on_their_own_score() {
        let config = PropagationConfig::default();
        let results = [
            AssessmentResult::new(n(1), 1.0),
            AssessmentResult::new(n(2), 0.0),
        ];
        let mut c = ctx(&config, &results);
        c.node_clusters.insert(n(1), ClusterId(1));
        c.node_clusters.insert(n(2), ClusterId(1));
        c.cluster_members.insert(ClusterId(1), vec![n(1), n(2)]);
        c.neighbors.insert(n(1), vec![neighbor(2, 1.0, 1)]);
        c.neighbors.insert(n(2), vec![neighbor(1, 1.0, 1)]);
        c.prior.insert(n(1), 0.5);
        c.prior.insert(n(2), 0.5);

        let out = compute(&c);
        assert!((out.values[&n(1)] - 0.55).abs() < 1e-12);
        assert!((out.values[&n(2)] - 0.45).abs() < 1e-12);
        assert_eq!(out.counts.propagated, 0);
    }

    #[test]
    fn paths_compound_in_caller_order() {
        let config = PropagationConfig::default();
        let results = [
            AssessmentResult::new(n(1), 1.0),
            AssessmentResult::new(n(2), 0.0),
        ];
        let mut c = ctx(&config, &results);
        c.neighbors.insert(n(1), vec![neighbor(3, 1.0, 1)]);
        c.neighbors.insert(n(2), vec![neighbor(3, 1.0, 2)]);

        let out = compute(&c);
        let after_first = 0.4 + 0.06 * (1.0 - 0.4);
        let expected = after_first + 0.06 * (0.0 - after_first);
        assert!((out.values[&n(3)] - expected).abs() < 1e-12);
        assert_eq!(out.counts.neighbor_steps, 2);
        assert_eq!(out.counts.propagated, 1);
    }

    #[test]
    fn no_neighbors_means_no_propagation() {
        let config = PropagationConfig::default();
        let results = [AssessmentResult::new(n(1), 0.7)];
        let mut c = ctx(&config, &results);
        c.node_clusters.insert(n(1), ClusterId(1));
        c.cluster_members.insert(ClusterId(1), vec![n(1)]);

        let out = compute(&c);
        assert_eq!(out.values.keys().copied().collect::<Vec<_>>(), vec![n(1)]);
        assert_eq!(out.counts.neighbor_steps, 0);
    }

    #[test]
    fn out_of_range_priors_are_clamped() {
        let config = PropagationConfig {
            alpha_direct: 0.5,
            ..Default::default()
        };
        let results = [AssessmentResult::new(n(1), 1.0)];
        let mut c = ctx(&config, &results);
        c.prior.insert(n(1), 1.8);

        let out = compute(&c);
        assert_eq!(out.values[&n(1)], 1.0);
    }
}
