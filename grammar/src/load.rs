use std::{fs, path::Path};

use common::FxHashSet;
use serde::Deserialize;

use crate::{
    context::Context,
    error::GrammarError,
    rule::{Rule, RuleIdOrCustom},
    tree::Tree,
};

/// one right-hand side in the grammar file: a format string with `{NT}`
/// references, or a dynamic leaf drawn from a character set
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Production {
    Format(String),
    Dynamic {
        chars: String,
        #[serde(default = "default_min_len")]
        min: usize,
        #[serde(default = "default_max_len")]
        max: usize,
    },
}

fn default_min_len() -> usize {
    1
}

fn default_max_len() -> usize {
    8
}

/// load a grammar file: a JSON list of `[nonterminal, production]` pairs,
/// the first pair's left-hand side is the start symbol
pub fn load_grammar(path: &Path) -> Result<Context, GrammarError> {
    let data =
        fs::read_to_string(path).map_err(|err| GrammarError::Read(format!("{path:?}: {err}")))?;
    let productions: Vec<(String, Production)> =
        serde_json::from_str(&data).map_err(|err| GrammarError::Parse(err.to_string()))?;

    let mut ctx = Context::new();
    let mut seen = FxHashSet::default();

    for (nonterm, production) in productions {
        match production {
            Production::Format(format) => {
                if !seen.insert((nonterm.clone(), format.clone())) {
                    return Err(GrammarError::DuplicateRule {
                        nonterm,
                        production: format,
                    });
                }
                ctx.add_format_rule(&nonterm, &format)?;
            }
            Production::Dynamic { chars, min, max } => {
                ctx.add_dynamic_rule(&nonterm, chars.as_bytes(), min, max)?;
            }
        }
    }

    ctx.initialize()?;
    Ok(ctx)
}

/// reload a tree sidecar dump (the JSON rule sequence written next to queue
/// entries) and rebuild the tree against `ctx`
pub fn load_tree(path: &Path, ctx: &Context) -> Result<Tree, GrammarError> {
    let data =
        fs::read_to_string(path).map_err(|err| GrammarError::Read(format!("{path:?}: {err}")))?;
    let rules: Vec<RuleIdOrCustom> =
        serde_json::from_str(&data).map_err(|err| GrammarError::Parse(err.to_string()))?;

    // validate before handing the sequence to the tree builder
    let mut open = 1usize;
    for (i, rule) in rules.iter().enumerate() {
        if open == 0 {
            return Err(GrammarError::Parse(format!(
                "trailing nodes after complete derivation at index {i}"
            )));
        }
        if rule.id().id() >= ctx.rule_count() {
            return Err(GrammarError::Parse(format!("unknown rule {}", rule.id())));
        }
        if matches!(
            (ctx.rule(rule.id()), rule),
            (Rule::Dynamic(_), RuleIdOrCustom::Rule(_))
        ) {
            return Err(GrammarError::Parse(format!(
                "dynamic rule {} without data",
                rule.id()
            )));
        }

        open -= 1;
        open += match rule {
            RuleIdOrCustom::Rule(id) => ctx.rule(*id).number_of_nonterms(),
            RuleIdOrCustom::Custom(..) => 0,
        };
    }
    if open != 0 || rules.is_empty() {
        return Err(GrammarError::Parse(
            "derivation has unexpanded nonterminals".into(),
        ));
    }

    Ok(Tree::from_rule_vec(rules, ctx))
}
