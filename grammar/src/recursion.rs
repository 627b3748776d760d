use common::random::FastRand;
use rand_distr::{Distribution, WeightedAliasIndex};

use crate::{
    context::Context,
    ids::{NTermId, NodeId},
    tree::{Tree, TreeView},
};

/// recursion pairs of one nonterminal within a tree: `(outer, inner)` nodes
/// sharing the nonterminal where `inner` is a descendant of `outer`
#[derive(Debug)]
pub struct RecursionInfo {
    pairs: Vec<(NodeId, NodeId)>,
    sampler: WeightedAliasIndex<usize>,
    nonterm: NTermId,
}

impl RecursionInfo {
    pub fn new(tree: &Tree, nonterm: NTermId, ctx: &Context) -> Option<Self> {
        let mut pairs = vec![];
        let mut weights = vec![];

        for i in 0..tree.size() {
            let inner = NodeId::new(i);
            if tree.nonterm(inner, ctx) != nonterm {
                continue;
            }

            // nearest ancestor expanding the same nonterminal
            let mut cur = inner;
            while let Some(parent) = tree.get_parent(cur) {
                if tree.nonterm(parent, ctx) == nonterm {
                    pairs.push((parent, inner));
                    weights.push(tree.subtree_size(parent) - tree.subtree_size(inner));
                    break;
                }
                cur = parent;
            }
        }

        if pairs.is_empty() {
            return None;
        }

        // bias the pick towards long recursion bodies
        let sampler = WeightedAliasIndex::new(weights).ok()?;

        Some(Self {
            pairs,
            sampler,
            nonterm,
        })
    }

    pub fn random_recursion_pair(&self) -> (NodeId, NodeId) {
        self.pairs[self.sampler.sample(&mut FastRand)]
    }

    pub fn pairs(&self) -> &[(NodeId, NodeId)] {
        &self.pairs
    }

    pub fn nonterm(&self) -> NTermId {
        self.nonterm
    }
}

/// recursion info for every nonterminal that recurses within `tree`
pub fn find_recursions(tree: &Tree, ctx: &Context) -> Vec<RecursionInfo> {
    ctx.nonterminals()
        .filter_map(|nt| RecursionInfo::new(tree, nt, ctx))
        .collect()
}
