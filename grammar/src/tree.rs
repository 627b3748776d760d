use std::slice;

use crate::{
    context::Context,
    ids::{NTermId, NodeId, RuleId},
    rule::{Rule, RuleChild, RuleIdOrCustom},
};

/// read access to a pre-order rule sequence, shared between owned trees and
/// splice views
pub trait TreeView {
    fn size(&self) -> usize;
    fn rule_or_custom(&self, n: NodeId) -> &RuleIdOrCustom;

    fn rule_id(&self, n: NodeId) -> RuleId {
        self.rule_or_custom(n).id()
    }

    fn nonterm(&self, n: NodeId, ctx: &Context) -> NTermId {
        ctx.rule(self.rule_id(n)).nonterm()
    }

    /// emit the terminal bytes of the subtree rooted at `start`, returns the
    /// number of nodes consumed
    fn unparse_node(&self, start: NodeId, ctx: &Context, out: &mut Vec<u8>) -> usize
    where
        Self: Sized,
    {
        unparse(self, start, ctx, out)
    }

    fn unparse_to(&self, ctx: &Context, out: &mut Vec<u8>)
    where
        Self: Sized,
    {
        out.clear();
        let consumed = unparse(self, NodeId::new(0), ctx, out);
        debug_assert_eq!(consumed, self.size());
    }

    /// materialize into an owned tree, rebuilding sizes and parents
    fn to_tree(&self, ctx: &Context) -> Tree {
        let rules = (0..self.size())
            .map(|i| self.rule_or_custom(NodeId::new(i)).clone())
            .collect();

        Tree::from_rule_vec(rules, ctx)
    }
}

/// a derivation tree in flat pre-order storage: `rules`, `sizes` and `paren`
/// are parallel arrays of equal length
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    rules: Vec<RuleIdOrCustom>,
    sizes: Vec<usize>,
    paren: Vec<NodeId>,
}

impl TreeView for Tree {
    fn size(&self) -> usize {
        self.rules.len()
    }

    fn rule_or_custom(&self, n: NodeId) -> &RuleIdOrCustom {
        &self.rules[n.id()]
    }
}

impl Tree {
    /// rebuild a tree from a complete pre-order rule sequence, deriving
    /// `sizes` and `paren` from the rule arities
    pub fn from_rule_vec(rules: Vec<RuleIdOrCustom>, ctx: &Context) -> Self {
        let len = rules.len();
        let mut sizes = vec![0; len];
        let mut paren = vec![NodeId::new(0); len];

        // stack of nodes with open nonterminal children
        let mut open: Vec<(usize, usize)> = vec![];
        for (i, rule) in rules.iter().enumerate() {
            if let Some((parent, remaining)) = open.last_mut() {
                paren[i] = NodeId::new(*parent);
                *remaining -= 1;
            } else if i != 0 {
                panic!("rule sequence is not a single derivation");
            }

            let arity = match rule {
                RuleIdOrCustom::Rule(id) => ctx.rule(*id).number_of_nonterms(),
                RuleIdOrCustom::Custom(..) => 0,
            };
            open.push((i, arity));

            while let Some(&(node, 0)) = open.last() {
                open.pop();
                sizes[node] = i - node + 1;
            }
        }
        debug_assert!(open.is_empty(), "derivation has unexpanded nonterminals");

        Self {
            rules,
            sizes,
            paren,
        }
    }

    pub fn rules(&self) -> &[RuleIdOrCustom] {
        &self.rules
    }

    pub fn subtree_size(&self, n: NodeId) -> usize {
        self.sizes[n.id()]
    }

    pub fn get_parent(&self, n: NodeId) -> Option<NodeId> {
        (n.id() != 0).then(|| self.paren[n.id()])
    }

    /// splice view replacing the subtree at `n` with the subtree of `other`
    /// rooted at `other_node`, without touching either operand
    pub fn mutate_replace_from_tree<'a>(
        &'a self,
        n: NodeId,
        other: &'a Tree,
        other_node: NodeId,
    ) -> TreeMutation<'a> {
        let end = n.id() + self.sizes[n.id()];
        let other_end = other_node.id() + other.sizes[other_node.id()];

        TreeMutation {
            prefix: &self.rules[..n.id()],
            repl: &other.rules[other_node.id()..other_end],
            postfix: &self.rules[end..],
        }
    }

    fn clear(&mut self) {
        self.rules.clear();
        self.sizes.clear();
        self.paren.clear();
    }

    /// regenerate this tree from `nt` within the given size budget
    pub fn generate_from_nt(&mut self, nt: NTermId, budget: usize, ctx: &Context) {
        self.generate_from_rule(ctx.random_rule_for_nt(nt, budget), budget, ctx);
    }

    pub fn generate_from_rule(&mut self, rule: RuleId, budget: usize, ctx: &Context) {
        self.clear();
        self.grow(rule, budget, NodeId::new(0), ctx);
    }

    // budget-driven top-down expansion, the budget is advisory: minimum
    // lengths always win
    fn grow(&mut self, rule: RuleId, budget: usize, parent: NodeId, ctx: &Context) -> usize {
        let node = self.rules.len();
        self.rules.push(match ctx.rule(rule) {
            Rule::Plain(_) => RuleIdOrCustom::Rule(rule),
            Rule::Dynamic(dynamic) => RuleIdOrCustom::Custom(rule, dynamic.generate()),
        });
        self.sizes.push(1);
        self.paren.push(parent);

        let mut used = 1;
        let budgets = ctx.child_budgets(rule, budget);
        for (&nt, child_budget) in ctx.rule(rule).nonterms().iter().zip(budgets) {
            let child_rule = ctx.random_rule_for_nt(nt, child_budget);
            used += self.grow(child_rule, child_budget, NodeId::new(node), ctx);
        }

        self.sizes[node] = used;
        used
    }
}

/// non-owning splice: iteration yields the prefix of the base tree, then the
/// replacement subtree, then the suffix behind the replaced subtree
#[derive(Debug)]
pub struct TreeMutation<'a> {
    prefix: &'a [RuleIdOrCustom],
    repl: &'a [RuleIdOrCustom],
    postfix: &'a [RuleIdOrCustom],
}

impl TreeView for TreeMutation<'_> {
    fn size(&self) -> usize {
        self.prefix.len() + self.repl.len() + self.postfix.len()
    }

    fn rule_or_custom(&self, n: NodeId) -> &RuleIdOrCustom {
        let i = n.id();

        if i < self.prefix.len() {
            &self.prefix[i]
        } else if i < self.prefix.len() + self.repl.len() {
            &self.repl[i - self.prefix.len()]
        } else {
            &self.postfix[i - self.prefix.len() - self.repl.len()]
        }
    }
}

fn unparse<T: TreeView>(view: &T, start: NodeId, ctx: &Context, out: &mut Vec<u8>) -> usize {
    fn open<'c, T: TreeView>(
        view: &T,
        node: usize,
        ctx: &'c Context,
        stack: &mut Vec<slice::Iter<'c, RuleChild>>,
        out: &mut Vec<u8>,
    ) {
        match view.rule_or_custom(NodeId::new(node)) {
            RuleIdOrCustom::Custom(_, data) => out.extend_from_slice(data),
            RuleIdOrCustom::Rule(id) => match ctx.rule(*id) {
                Rule::Plain(plain) => stack.push(plain.children().iter()),
                // dynamic rules only occur as custom leaves
                Rule::Dynamic(_) => {}
            },
        }
    }

    enum Step<'c> {
        Term(&'c [u8]),
        Open,
        Close,
    }

    // explicit stack so deep trees cannot overflow the call stack
    let mut stack = vec![];
    let mut cursor = start.id();

    open(view, cursor, ctx, &mut stack, out);
    cursor += 1;

    while let Some(children) = stack.last_mut() {
        let step = match children.next() {
            Some(RuleChild::Term(data)) => Step::Term(data),
            Some(RuleChild::NTerm(_)) => Step::Open,
            None => Step::Close,
        };

        match step {
            Step::Term(data) => out.extend_from_slice(data),
            Step::Open => {
                open(view, cursor, ctx, &mut stack, out);
                cursor += 1;
            }
            Step::Close => {
                stack.pop();
            }
        }
    }

    cursor - start.id()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn letter_grammar() -> Context {
        // S -> "a" S | "b"
        let mut ctx = Context::new();
        ctx.add_format_rule("S", "a{S}").unwrap();
        ctx.add_format_rule("S", "b").unwrap();
        ctx.initialize().unwrap();
        ctx
    }

    pub(crate) fn unparse_tree(tree: &Tree, ctx: &Context) -> Vec<u8> {
        let mut out = vec![];
        tree.unparse_to(ctx, &mut out);
        out
    }

    // sizes[i] == 1 + sum of child sizes, paren consistent with pre-order
    pub(crate) fn check_invariants(tree: &Tree) {
        assert_eq!(tree.sizes.len(), tree.rules.len());
        assert_eq!(tree.paren.len(), tree.rules.len());
        if tree.size() == 0 {
            return;
        }

        assert_eq!(tree.sizes[0], tree.rules.len());
        for i in 0..tree.size() {
            let children: Vec<usize> = (i + 1..i + tree.sizes[i])
                .filter(|&j| tree.paren[j].id() == i)
                .collect();
            let child_sum: usize = children.iter().map(|&j| tree.sizes[j]).sum();
            assert_eq!(tree.sizes[i], 1 + child_sum, "size mismatch at node {i}");

            for &j in &children {
                assert!(j > i && j < i + tree.sizes[i]);
            }
        }
    }

    pub(crate) fn aab_tree(ctx: &Context) -> Tree {
        // S -> aS -> aaS -> aab
        let a = RuleId::new(0);
        let b = RuleId::new(1);
        Tree::from_rule_vec(
            vec![
                RuleIdOrCustom::Rule(a),
                RuleIdOrCustom::Rule(a),
                RuleIdOrCustom::Rule(b),
            ],
            ctx,
        )
    }

    #[test]
    fn from_rule_vec_rebuilds_structure() {
        let ctx = letter_grammar();
        let tree = aab_tree(&ctx);

        check_invariants(&tree);
        assert_eq!(tree.size(), 3);
        assert_eq!(tree.subtree_size(NodeId::new(0)), 3);
        assert_eq!(tree.subtree_size(NodeId::new(1)), 2);
        assert_eq!(tree.subtree_size(NodeId::new(2)), 1);
        assert_eq!(tree.get_parent(NodeId::new(0)), None);
        assert_eq!(tree.get_parent(NodeId::new(1)), Some(NodeId::new(0)));
        assert_eq!(tree.get_parent(NodeId::new(2)), Some(NodeId::new(1)));
    }

    #[test]
    fn unparse_in_derivation_order() {
        let ctx = letter_grammar();
        let tree = aab_tree(&ctx);

        assert_eq!(unparse_tree(&tree, &ctx), b"aab");
    }

    #[test]
    fn unparse_interleaves_terminals() {
        // A -> "x" B "y", B -> "0" | "1"
        let mut ctx = Context::new();
        ctx.add_format_rule("A", "x{B}y").unwrap();
        ctx.add_format_rule("B", "0").unwrap();
        ctx.add_format_rule("B", "1").unwrap();
        ctx.initialize().unwrap();

        let tree = Tree::from_rule_vec(
            vec![
                RuleIdOrCustom::Rule(RuleId::new(0)),
                RuleIdOrCustom::Rule(RuleId::new(1)),
            ],
            &ctx,
        );
        assert_eq!(unparse_tree(&tree, &ctx), b"x0y");
    }

    #[test]
    fn generation_respects_min_len() {
        let ctx = letter_grammar();
        let nt = ctx.nt_id("S").unwrap();
        let mut tree = Tree::default();

        // budget below the minimum still yields a valid minimal tree
        tree.generate_from_nt(nt, 0, &ctx);
        check_invariants(&tree);
        assert_eq!(tree.size(), 1);
        assert_eq!(unparse_tree(&tree, &ctx), b"b");
    }

    #[test]
    fn generation_invariants_hold() {
        let ctx = letter_grammar();
        let nt = ctx.nt_id("S").unwrap();
        let mut tree = Tree::default();

        for seed in 0..50 {
            fastrand::seed(seed);
            let budget = ctx.random_len_for_nt(nt);
            tree.generate_from_nt(nt, budget, &ctx);

            check_invariants(&tree);
            for i in 0..tree.size() {
                let n = NodeId::new(i);
                assert!(tree.subtree_size(n) >= ctx.min_len_for_nt(tree.nonterm(n, &ctx)));
            }
        }
    }

    #[test]
    fn splice_view_order_and_materialization() {
        let ctx = letter_grammar();
        let tree = aab_tree(&ctx);

        // replace the subtree at node 1 ("ab") with a minimal tree ("b")
        let mut minimal = Tree::default();
        minimal.generate_from_nt(ctx.nt_id("S").unwrap(), 1, &ctx);

        let view = tree.mutate_replace_from_tree(NodeId::new(1), &minimal, NodeId::new(0));
        assert_eq!(view.size(), 2);

        let mut out = vec![];
        view.unparse_to(&ctx, &mut out);
        assert_eq!(out, b"ab");

        let materialized = view.to_tree(&ctx);
        check_invariants(&materialized);
        assert_eq!(unparse_tree(&materialized, &ctx), b"ab");

        // operands are untouched
        assert_eq!(unparse_tree(&tree, &ctx), b"aab");
        assert_eq!(unparse_tree(&minimal, &ctx), b"b");
    }

    #[test]
    fn splice_view_within_one_tree() {
        let ctx = letter_grammar();
        let tree = aab_tree(&ctx);

        // hoist the leaf at node 2 up to node 0
        let view = tree.mutate_replace_from_tree(NodeId::new(0), &tree, NodeId::new(2));
        let mut out = vec![];
        view.unparse_to(&ctx, &mut out);
        assert_eq!(out, b"b");
    }

    #[test]
    fn unparse_roundtrips_through_rule_vec() {
        let ctx = letter_grammar();
        let nt = ctx.nt_id("S").unwrap();
        let mut tree = Tree::default();

        for seed in 0..20 {
            fastrand::seed(seed);
            tree.generate_from_nt(nt, 40, &ctx);

            // rebuilding from the rule sequence yields a structurally
            // identical tree
            let rebuilt = Tree::from_rule_vec(tree.rules().to_vec(), &ctx);
            assert_eq!(rebuilt, tree);
        }
    }

    #[test]
    fn custom_leaves_unparse_their_data() {
        let mut ctx = Context::new();
        ctx.add_format_rule("S", "[{NUM}]").unwrap();
        ctx.add_dynamic_rule("NUM", b"0123456789", 1, 4).unwrap();
        ctx.initialize().unwrap();

        let mut tree = Tree::default();
        tree.generate_from_nt(ctx.nt_id("S").unwrap(), 10, &ctx);

        check_invariants(&tree);
        assert_eq!(tree.size(), 2);
        let out = unparse_tree(&tree, &ctx);
        assert_eq!(out.first(), Some(&b'['));
        assert_eq!(out.last(), Some(&b']'));
        assert!(out[1..out.len() - 1].iter().all(u8::is_ascii_digit));
        assert_eq!(out.len(), tree.rule_or_custom(NodeId::new(1)).data().len() + 2);
    }
}
