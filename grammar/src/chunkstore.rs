use std::collections::VecDeque;

use common::{
    config::chunkstore::{MAX_CHUNKS_PER_RULE, MAX_CHUNK_SIZE},
    FxHashMap, FxHashSet,
};

use crate::{
    context::Context,
    ids::{NodeId, RuleId},
    tree::{Tree, TreeView},
};

/// cross-tree memory of subtrees keyed by their root rule, feeds the splicing
/// mutation
#[derive(Debug, Default)]
pub struct ChunkStore {
    trees: Vec<Tree>,
    chunks: FxHashMap<RuleId, VecDeque<(usize, NodeId)>>,
    // unparsed subtrees already stored, used for dedup
    seen: FxHashSet<Vec<u8>>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tree(&mut self, tree: Tree, ctx: &Context) {
        let mut buffer = vec![];
        let mut keep = false;

        for i in 0..tree.size() {
            let n = NodeId::new(i);
            if tree.subtree_size(n) > MAX_CHUNK_SIZE {
                continue;
            }

            buffer.clear();
            tree.unparse_node(n, ctx, &mut buffer);
            if !self.seen.insert(buffer.clone()) {
                continue;
            }

            log::trace!("new chunk for rule {}: {:?}", tree.rule_id(n), buffer);
            let entries = self.chunks.entry(tree.rule_id(n)).or_default();
            if entries.len() == MAX_CHUNKS_PER_RULE {
                // evict the oldest entry, its backing tree stays shared
                entries.pop_front();
            }
            entries.push_back((self.trees.len(), n));
            keep = true;
        }

        if keep {
            self.trees.push(tree);
        }
    }

    /// a random stored subtree expanding `rule`, if any
    pub fn get_alternative_to(&self, rule: RuleId) -> Option<(&Tree, NodeId)> {
        let entries = self.chunks.get(&rule)?;
        let (tree, node) = entries[fastrand::usize(0..entries.len())];

        Some((&self.trees[tree], node))
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.values().map(VecDeque::len).sum()
    }
}
