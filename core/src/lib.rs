//! Core data structures and seams for grammar-constrained decoding: the
//! vocabulary byte trie, the byte mask the parser reports legal
//! continuations through, and the traits the decoder drives — the Earley
//! parser on one side, the logit oracle on the other.

pub mod bytemask;
pub mod bytes;
pub mod oracle;
pub mod parser;
pub mod trie;

pub type TokenId = bytes::TokenId;

pub use bytemask::ByteMask;
pub use oracle::LogitOracle;
pub use parser::{CommitParser, CommitPoint, InnerNode, ParseTree, TerminalNode};
pub use trie::{ByteTrie, NodeId, ROOT};

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("unsupported option: {0}")]
    Unsupported(String),

    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error("oracle returned {got} logits for a vocabulary of {want}")]
    OracleShape { got: usize, want: usize },
}
