use common::{config::grammar::MAX_RANDOM_LEN, FxHashMap};

use crate::{
    error::GrammarError,
    ids::{NTermId, RuleId},
    rule::{DynamicRule, PlainRule, Rule},
};

const INFINITE: usize = usize::MAX;

/// immutable after `initialize`: the rule set grouped by nonterminal plus the
/// precomputed minimum derivation lengths
#[derive(Debug, Default)]
pub struct Context {
    rules: Vec<Rule>,
    nts_to_rules: Vec<Vec<RuleId>>,
    nt_names: Vec<String>,
    names_to_nt: FxHashMap<String, NTermId>,
    min_len_nt: Vec<usize>,
    min_len_rule: Vec<usize>,
    max_random_len: usize,
}

impl Context {
    pub fn new() -> Self {
        Self {
            max_random_len: MAX_RANDOM_LEN,
            ..Default::default()
        }
    }

    fn intern_nt(&mut self, name: &str) -> NTermId {
        if let Some(id) = self.names_to_nt.get(name) {
            return *id;
        }

        let id = NTermId::new(self.nt_names.len());
        self.nt_names.push(name.to_string());
        self.nts_to_rules.push(vec![]);
        self.names_to_nt.insert(name.to_string(), id);

        id
    }

    pub fn add_format_rule(&mut self, nonterm: &str, format: &str) -> Result<RuleId, GrammarError> {
        let lhs = self.intern_nt(nonterm);
        let rule = PlainRule::from_format(lhs, format, |name| self.intern_nt(name))?;

        Ok(self.push_rule(Rule::Plain(rule)))
    }

    pub fn add_dynamic_rule(
        &mut self,
        nonterm: &str,
        charset: &[u8],
        min_len: usize,
        max_len: usize,
    ) -> Result<RuleId, GrammarError> {
        let lhs = self.intern_nt(nonterm);
        let rule = DynamicRule::new(lhs, nonterm, charset, min_len, max_len)?;

        Ok(self.push_rule(Rule::Dynamic(rule)))
    }

    fn push_rule(&mut self, rule: Rule) -> RuleId {
        let id = RuleId::new(self.rules.len());
        self.nts_to_rules[rule.nonterm().id()].push(id);
        self.rules.push(rule);

        id
    }

    /// compute the minimum derivation lengths by fixed-point iteration and
    /// reject grammars with undefined or unproductive nonterminals
    pub fn initialize(&mut self) -> Result<(), GrammarError> {
        if self.rules.is_empty() {
            return Err(GrammarError::Empty);
        }

        for (nt, rules) in self.nts_to_rules.iter().enumerate() {
            if rules.is_empty() {
                return Err(GrammarError::Undefined(self.nt_names[nt].clone()));
            }
        }

        self.min_len_rule = vec![INFINITE; self.rules.len()];
        self.min_len_nt = vec![INFINITE; self.nt_names.len()];

        loop {
            let mut changed = false;

            for (i, rule) in self.rules.iter().enumerate() {
                let mut len = 1;
                for nt in rule.nonterms() {
                    match self.min_len_nt[nt.id()] {
                        INFINITE => {
                            len = INFINITE;
                            break;
                        }
                        min => len += min,
                    }
                }

                if len < self.min_len_rule[i] {
                    self.min_len_rule[i] = len;
                    changed = true;
                }
                if len < self.min_len_nt[rule.nonterm().id()] {
                    self.min_len_nt[rule.nonterm().id()] = len;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        for (nt, &min) in self.min_len_nt.iter().enumerate() {
            if min == INFINITE {
                return Err(GrammarError::Unproductive(self.nt_names[nt].clone()));
            }
        }
        debug_assert!(self.min_len_rule.iter().all(|&min| min != INFINITE));

        Ok(())
    }

    /// the start symbol is the left-hand side of the first production
    pub fn start(&self) -> NTermId {
        NTermId::new(0)
    }

    pub fn rule(&self, rule: RuleId) -> &Rule {
        &self.rules[rule.id()]
    }

    pub fn rules_for_nt(&self, nt: NTermId) -> &[RuleId] {
        &self.nts_to_rules[nt.id()]
    }

    pub fn nt_name(&self, nt: NTermId) -> &str {
        &self.nt_names[nt.id()]
    }

    pub fn nt_id(&self, name: &str) -> Option<NTermId> {
        self.names_to_nt.get(name).copied()
    }

    pub fn nonterminals(&self) -> impl Iterator<Item = NTermId> {
        (0..self.nt_names.len()).map(NTermId::new)
    }

    pub fn nt_count(&self) -> usize {
        self.nt_names.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn min_len_for_nt(&self, nt: NTermId) -> usize {
        self.min_len_nt[nt.id()]
    }

    pub fn min_len_for_rule(&self, rule: RuleId) -> usize {
        self.min_len_rule[rule.id()]
    }

    pub fn has_multiple_rules(&self, nt: NTermId) -> bool {
        self.nts_to_rules[nt.id()].len() > 1
    }

    pub fn random_len_for_nt(&self, nt: NTermId) -> usize {
        random_len(self.min_len_for_nt(nt), self.max_random_len)
    }

    pub fn random_len_for_rule(&self, rule: RuleId) -> usize {
        random_len(self.min_len_for_rule(rule), self.max_random_len)
    }

    /// uniform pick among the rules of `nt` fitting the budget, falling back
    /// to a minimum-length rule when none fits
    pub fn random_rule_for_nt(&self, nt: NTermId, budget: usize) -> RuleId {
        let rules = &self.nts_to_rules[nt.id()];

        let fitting: Vec<RuleId> = rules
            .iter()
            .copied()
            .filter(|&rule| self.min_len_for_rule(rule) <= budget)
            .collect();
        if !fitting.is_empty() {
            return fitting[fastrand::usize(0..fitting.len())];
        }

        let min = self.min_len_for_nt(nt);
        let smallest: Vec<RuleId> = rules
            .iter()
            .copied()
            .filter(|&rule| self.min_len_for_rule(rule) == min)
            .collect();

        smallest[fastrand::usize(0..smallest.len())]
    }

    /// distribute a budget over the nonterminal children of `rule`: every
    /// child receives at least its minimum, the surplus is split at random
    /// with the allocation order shuffled to avoid biasing early children
    pub(crate) fn child_budgets(&self, rule: RuleId, budget: usize) -> Vec<usize> {
        let nonterms = self.rule(rule).nonterms();
        if nonterms.is_empty() {
            return vec![];
        }

        let mins: Vec<usize> = nonterms
            .iter()
            .map(|&nt| self.min_len_for_nt(nt))
            .collect();
        let mut surplus = budget.saturating_sub(1 + mins.iter().sum::<usize>());

        let mut extra = vec![0; nonterms.len()];
        let mut order: Vec<usize> = (0..nonterms.len()).collect();
        fastrand::shuffle(&mut order);

        for (remaining, &child) in order.iter().enumerate().map(|(i, c)| (order.len() - i, c)) {
            let share = if remaining == 1 {
                surplus
            } else {
                fastrand::usize(0..=surplus)
            };
            extra[child] = share;
            surplus -= share;
        }

        mins.into_iter().zip(extra).map(|(min, e)| min + e).collect()
    }
}

fn random_len(min: usize, cap: usize) -> usize {
    fastrand::usize(min..=cap.max(min))
}
