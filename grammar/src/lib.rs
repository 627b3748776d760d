mod chunkstore;
mod context;
mod error;
mod ids;
mod load;
mod mutator;
mod recursion;
mod rule;
mod tree;

pub use crate::{
    chunkstore::ChunkStore,
    context::Context,
    error::GrammarError,
    ids::{NTermId, NodeId, RuleId},
    load::{load_grammar, load_tree},
    mutator::{find_parent_with_nt, Mutator},
    recursion::{find_recursions, RecursionInfo},
    rule::{DynamicRule, PlainRule, Rule, RuleChild, RuleIdOrCustom},
    tree::{Tree, TreeMutation, TreeView},
};
