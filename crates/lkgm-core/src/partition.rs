//! Disjoint transactions over ready changes.
//!
//! Changes linked by dependencies (in either direction, transitively) must be
//! tested together; unrelated changes can be tested by separate speculative
//! jobs. The partition is the set of connected components of the dependency
//! graph restricted to ready changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::capabilities::PatchProvider;
use crate::domain::{Change, Result};

/// Source of dependency edges between changes.
#[async_trait]
pub trait DependencyStrategy: Send + Sync {
    /// Review numbers `change` depends on that are not yet merged.
    async fn dependencies(&self, change: &Change) -> Result<Vec<u64>>;
}

/// Edges declared in the review system.
pub struct ReviewDependencies {
    patches: Arc<dyn PatchProvider>,
}

impl ReviewDependencies {
    pub fn new(patches: Arc<dyn PatchProvider>) -> Self {
        Self { patches }
    }
}

#[async_trait]
impl DependencyStrategy for ReviewDependencies {
    async fn dependencies(&self, change: &Change) -> Result<Vec<u64>> {
        self.patches.dependencies(change).await
    }
}

/// A fixed edge map.
#[derive(Debug, Clone, Default)]
pub struct StaticDependencies {
    edges: HashMap<u64, Vec<u64>>,
}

impl StaticDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_edge(mut self, change: u64, depends_on: u64) -> Self {
        self.edges.entry(change).or_default().push(depends_on);
        self
    }
}

#[async_trait]
impl DependencyStrategy for StaticDependencies {
    async fn dependencies(&self, change: &Change) -> Result<Vec<u64>> {
        Ok(self.edges.get(&change.number).cloned().unwrap_or_default())
    }
}

/// Changes tested together, ordered by review number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub changes: Vec<Change>,
}

impl Transaction {
    pub fn numbers(&self) -> Vec<u64> {
        self.changes.iter().map(|c| c.number).collect()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Launchable transactions, ordered by their smallest member.
    pub transactions: Vec<Transaction>,
    /// Components over `max_txn_length`; reported, never truncated.
    pub oversized: Vec<Transaction>,
    /// Components depending on a change that is not ready, with the
    /// missing dependencies.
    pub blocked: Vec<(Transaction, Vec<u64>)>,
}

impl Partition {
    /// Every change that appears in some part of the partition.
    pub fn covered(&self) -> HashSet<u64> {
        self.transactions
            .iter()
            .chain(self.oversized.iter())
            .chain(self.blocked.iter().map(|(t, _)| t))
            .flat_map(|t| t.numbers())
            .collect()
    }
}

pub struct TransactionPartitioner {
    strategy: Arc<dyn DependencyStrategy>,
    max_txn_length: usize,
}

impl TransactionPartitioner {
    pub fn new(strategy: Arc<dyn DependencyStrategy>, max_txn_length: usize) -> Self {
        Self {
            strategy,
            max_txn_length: max_txn_length.max(1),
        }
    }

    /// Partition `ready` into disjoint transactions.
    ///
    /// Components are formed over all ready changes; members in `passed` are
    /// then dropped since they need no further testing, and a component left
    /// empty disappears.
    pub async fn partition(&self, ready: &[Change], passed: &HashSet<u64>) -> Result<Partition> {
        let index: HashMap<u64, usize> = ready
            .iter()
            .enumerate()
            .map(|(i, c)| (c.number, i))
            .collect();
        let mut sets = DisjointSets::new(ready.len());
        let mut missing: HashMap<usize, Vec<u64>> = HashMap::new();

        for (i, change) in ready.iter().enumerate() {
            for dep in self.strategy.dependencies(change).await? {
                match index.get(&dep) {
                    Some(&j) => sets.union(i, j),
                    None => missing.entry(i).or_default().push(dep),
                }
            }
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..ready.len() {
            components.entry(sets.find(i)).or_default().push(i);
        }

        let mut partition = Partition::default();
        let mut ordered: Vec<(Transaction, Vec<u64>)> = Vec::new();
        for members in components.into_values() {
            let mut blocked_on: Vec<u64> = members
                .iter()
                .flat_map(|i| missing.get(i).cloned().unwrap_or_default())
                .collect();
            blocked_on.sort_unstable();
            blocked_on.dedup();

            let mut changes: Vec<Change> = members
                .iter()
                .map(|&i| ready[i].clone())
                .filter(|c| !passed.contains(&c.number))
                .collect();
            if changes.is_empty() {
                continue;
            }
            changes.sort_by_key(|c| c.number);
            ordered.push((Transaction { changes }, blocked_on));
        }
        ordered.sort_by_key(|(t, _)| t.changes[0].number);

        for (txn, blocked_on) in ordered {
            if !blocked_on.is_empty() {
                partition.blocked.push((txn, blocked_on));
            } else if txn.len() > self.max_txn_length {
                tracing::warn!(
                    changes = ?txn.numbers(),
                    limit = self.max_txn_length,
                    "transaction exceeds maximum length"
                );
                partition.oversized.push(txn);
            } else {
                partition.transactions.push(txn);
            }
        }
        Ok(partition)
    }
}

struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index as root keeps component order stable.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}
