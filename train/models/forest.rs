//! Random forest of Gini classification trees.

use super::{Classifier, ModelError, check_features, check_training_data};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_trees: usize,
    /// Maximum tree depth; unlimited when `None`.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features tried per split; `sqrt(n_features)` when `None`.
    pub max_features: Option<usize>,
    pub bootstrap: bool,
    /// Tree `i` draws from `ChaCha8Rng::seed_from_u64(seed + i)`.
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            bootstrap: true,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        positive_fraction: f64,
    },
    /// Children are indices into the owning tree's node list, always after the parent.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A tree stored as a flat node list with the root first. Growing, walking and
/// dropping it never recurses, however deep it gets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { positive_fraction } => return *positive_fraction,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    fn depth(&self) -> usize {
        let mut depths = vec![1usize; self.nodes.len()];
        for (at, node) in self.nodes.iter().enumerate() {
            if let Node::Split { left, right, .. } = *node {
                depths[left] = depths[at] + 1;
                depths[right] = depths[at] + 1;
            }
        }
        depths.into_iter().max().unwrap_or(0)
    }
}

struct TreeBuilder<'a, 'x, 'y> {
    x: ArrayView2<'x, f64>,
    y: ArrayView1<'y, f64>,
    config: &'a ForestConfig,
    max_features: usize,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

/// A node slot still to be grown from `indices[start..end]`.
struct Pending {
    slot: usize,
    start: usize,
    end: usize,
    depth: usize,
}

fn gini(positives: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    let p = positives / total;
    2.0 * p * (1.0 - p)
}

impl TreeBuilder<'_, '_, '_> {
    /// Grows one tree depth-first, left subtree before right.
    fn build(&self, indices: &mut [usize], rng: &mut ChaCha8Rng) -> Tree {
        let mut nodes = vec![Node::Leaf {
            positive_fraction: 0.0,
        }];
        let mut stack = vec![Pending {
            slot: 0,
            start: 0,
            end: indices.len(),
            depth: 0,
        }];
        while let Some(Pending {
            slot,
            start,
            end,
            depth,
        }) = stack.pop()
        {
            let members = &mut indices[start..end];
            let Some(cut) = self.split_members(members, depth, rng, &mut nodes[slot]) else {
                continue;
            };
            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::Leaf {
                positive_fraction: 0.0,
            });
            nodes.push(Node::Leaf {
                positive_fraction: 0.0,
            });
            if let Node::Split {
                left: l, right: r, ..
            } = &mut nodes[slot]
            {
                (*l, *r) = (left, right);
            }
            stack.push(Pending {
                slot: right,
                start: start + cut,
                end,
                depth: depth + 1,
            });
            stack.push(Pending {
                slot: left,
                start,
                end: start + cut,
                depth: depth + 1,
            });
        }
        Tree { nodes }
    }

    /// Writes a leaf or a split into `node`. For a split, `members` is
    /// reordered left-side first and the size of the left side is returned.
    fn split_members(
        &self,
        members: &mut [usize],
        depth: usize,
        rng: &mut ChaCha8Rng,
        node: &mut Node,
    ) -> Option<usize> {
        let n = members.len();
        let positives: f64 = members.iter().map(|&i| self.y[i]).sum();
        *node = Node::Leaf {
            positive_fraction: positives / n as f64,
        };
        let pure = positives == 0.0 || positives == n as f64;
        let too_deep = self.config.max_depth.is_some_and(|d| depth >= d);
        if pure || too_deep || n < self.config.min_samples_split.max(2) {
            return None;
        }

        let split = self.best_split(members, positives, rng)?;
        if split.impurity >= gini(positives, n as f64) {
            return None;
        }

        let x = self.x;
        members.sort_unstable_by(|&a, &b| {
            let left_a = x[[a, split.feature]] <= split.threshold;
            let left_b = x[[b, split.feature]] <= split.threshold;
            left_b.cmp(&left_a)
        });
        let cut = members
            .iter()
            .position(|&i| x[[i, split.feature]] > split.threshold)
            .unwrap_or(n);
        *node = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: 0,
            right: 0,
        };
        Some(cut)
    }

    fn best_split(&self, indices: &[usize], positives: f64, rng: &mut ChaCha8Rng) -> Option<BestSplit> {
        let n = indices.len();
        let min_leaf = self.config.min_samples_leaf.max(1);
        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);
        features.truncate(self.max_features);

        let mut best: Option<BestSplit> = None;
        let mut order: Vec<usize> = indices.to_vec();
        for &feature in &features {
            let column = self.x.column(feature);
            order.sort_unstable_by(|&a, &b| column[a].total_cmp(&column[b]));

            let mut left_positives = 0.0;
            for split_at in 1..n {
                left_positives += self.y[order[split_at - 1]];
                let (lo, hi) = (column[order[split_at - 1]], column[order[split_at]]);
                if lo == hi || split_at < min_leaf || n - split_at < min_leaf {
                    continue;
                }
                let left_n = split_at as f64;
                let right_n = (n - split_at) as f64;
                let impurity = (left_n * gini(left_positives, left_n)
                    + right_n * gini(positives - left_positives, right_n))
                    / n as f64;
                if best.as_ref().is_none_or(|b| impurity < b.impurity) {
                    best = Some(BestSplit {
                        feature,
                        threshold: lo + (hi - lo) / 2.0,
                        impurity,
                    });
                }
            }
        }
        best
    }
}

/// Bagged Gini trees, built in parallel; probabilities average the leaf fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    config: ForestConfig,
    n_features: usize,
    trees: Vec<Tree>,
}

impl RandomForest {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            n_features: 0,
            trees: Vec::new(),
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn max_depth(&self) -> usize {
        self.trees.iter().map(Tree::depth).max().unwrap_or(0)
    }
}

impl Classifier for RandomForest {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_data(x, y)?;
        let n = x.nrows();
        let n_features = x.ncols();
        let max_features = self
            .config
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt().floor() as usize)
            .clamp(1, n_features.max(1));
        let builder = TreeBuilder {
            x,
            y,
            config: &self.config,
            max_features,
        };

        let trees: Vec<Tree> = (0..self.config.n_trees)
            .into_par_iter()
            .map(|i| {
                let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(i as u64));
                let mut indices: Vec<usize> = if self.config.bootstrap {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                builder.build(&mut indices, &mut rng)
            })
            .collect();

        log::debug!(
            "Random forest: {} trees over {} features ({} per split)",
            trees.len(),
            n_features,
            max_features
        );
        self.n_features = n_features;
        self.trees = trees;
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::NotFitted);
        }
        check_features(self.n_features, x)?;
        let n_trees = self.trees.len() as f64;
        Ok(x
            .outer_iter()
            .map(|row| self.trees.iter().map(|t| t.predict(row)).sum::<f64>() / n_trees)
            .collect())
    }
}
