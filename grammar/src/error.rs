use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrammarError {
    #[error("grammar contains no productions")]
    Empty,

    #[error("nonterminal {0:?} is referenced but never defined")]
    Undefined(String),

    #[error("nonterminal {0:?} has no finite derivation")]
    Unproductive(String),

    #[error("duplicate production for {nonterm:?}: {production:?}")]
    DuplicateRule { nonterm: String, production: String },

    #[error("unclosed nonterminal reference in {0:?}")]
    UnclosedReference(String),

    #[error("empty nonterminal reference in {0:?}")]
    EmptyReference(String),

    #[error("stray '}}' in {0:?}, escape it as '\\}}'")]
    StrayBrace(String),

    #[error("dynamic production for {0:?} has an empty character set")]
    EmptyCharset(String),

    #[error("dynamic production for {0:?} has min length > max length")]
    InvalidLengthRange(String),

    #[error("failed to read grammar file: {0}")]
    Read(String),

    #[error("failed to parse grammar file: {0}")]
    Parse(String),
}
