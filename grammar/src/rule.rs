use serde::{Deserialize, Serialize};

use crate::{
    error::GrammarError,
    ids::{NTermId, RuleId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChild {
    Term(Vec<u8>),
    NTerm(NTermId),
}

/// a production from the grammar file, either a fixed right-hand side or a
/// dynamic leaf expanded at generation time
#[derive(Debug, Clone)]
pub enum Rule {
    Plain(PlainRule),
    Dynamic(DynamicRule),
}

#[derive(Debug, Clone)]
pub struct PlainRule {
    nonterm: NTermId,
    children: Vec<RuleChild>,
    nonterms: Vec<NTermId>,
}

#[derive(Debug, Clone)]
pub struct DynamicRule {
    nonterm: NTermId,
    charset: Vec<u8>,
    min_len: usize,
    max_len: usize,
}

/// node payload: a grammar rule, or a dynamic expansion carrying the bytes it
/// produced (always a leaf)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleIdOrCustom {
    Rule(RuleId),
    Custom(RuleId, Vec<u8>),
}

impl Rule {
    pub fn nonterm(&self) -> NTermId {
        match self {
            Rule::Plain(plain) => plain.nonterm,
            Rule::Dynamic(dynamic) => dynamic.nonterm,
        }
    }

    pub fn nonterms(&self) -> &[NTermId] {
        match self {
            Rule::Plain(plain) => &plain.nonterms,
            Rule::Dynamic(_) => &[],
        }
    }

    pub fn number_of_nonterms(&self) -> usize {
        self.nonterms().len()
    }
}

impl PlainRule {
    /// parse a production format: `{NT}` references a nonterminal, everything
    /// else is literal bytes, `\{`, `\}` and `\\` escape
    pub fn from_format<F>(
        nonterm: NTermId,
        format: &str,
        mut intern: F,
    ) -> Result<Self, GrammarError>
    where
        F: FnMut(&str) -> NTermId,
    {
        let bytes = format.as_bytes();
        let mut children = vec![];
        let mut term = vec![];
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    term.push(bytes[i + 1]);
                    i += 2;
                }
                b'{' => {
                    let len = bytes[i + 1..]
                        .iter()
                        .position(|&byte| byte == b'}')
                        .ok_or_else(|| GrammarError::UnclosedReference(format.into()))?;
                    if len == 0 {
                        return Err(GrammarError::EmptyReference(format.into()));
                    }

                    if !term.is_empty() {
                        children.push(RuleChild::Term(std::mem::take(&mut term)));
                    }

                    // the braces are ascii, so this slice is on char boundaries
                    let name = &format[i + 1..i + 1 + len];
                    children.push(RuleChild::NTerm(intern(name)));
                    i += len + 2;
                }
                b'}' => return Err(GrammarError::StrayBrace(format.into())),
                byte => {
                    term.push(byte);
                    i += 1;
                }
            }
        }

        if !term.is_empty() {
            children.push(RuleChild::Term(term));
        }

        let nonterms = children
            .iter()
            .filter_map(|child| match child {
                RuleChild::NTerm(nt) => Some(*nt),
                RuleChild::Term(_) => None,
            })
            .collect();

        Ok(Self {
            nonterm,
            children,
            nonterms,
        })
    }

    pub fn children(&self) -> &[RuleChild] {
        &self.children
    }

    pub fn nonterms(&self) -> &[NTermId] {
        &self.nonterms
    }
}

impl DynamicRule {
    pub fn new(
        nonterm: NTermId,
        nonterm_name: &str,
        charset: &[u8],
        min_len: usize,
        max_len: usize,
    ) -> Result<Self, GrammarError> {
        if charset.is_empty() {
            return Err(GrammarError::EmptyCharset(nonterm_name.into()));
        }
        if min_len > max_len {
            return Err(GrammarError::InvalidLengthRange(nonterm_name.into()));
        }

        Ok(Self {
            nonterm,
            charset: charset.to_vec(),
            min_len,
            max_len,
        })
    }

    /// draw a fresh expansion for this leaf
    pub fn generate(&self) -> Vec<u8> {
        let len = fastrand::usize(self.min_len..=self.max_len);

        (0..len)
            .map(|_| self.charset[fastrand::usize(0..self.charset.len())])
            .collect()
    }
}

impl RuleIdOrCustom {
    pub fn id(&self) -> RuleId {
        match self {
            RuleIdOrCustom::Rule(id) | RuleIdOrCustom::Custom(id, _) => *id,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            RuleIdOrCustom::Rule(_) => &[],
            RuleIdOrCustom::Custom(_, data) => data,
        }
    }
}
