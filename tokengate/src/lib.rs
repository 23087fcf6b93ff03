//! Grammar-constrained token generation.
//!
//! Given a vocabulary of byte-sequence tokens, a prompt, a grammar behind
//! the [`CommitParser`] seam, and a [`LogitOracle`], a [`TokenStream`]
//! yields model-sampled output whose concatenated bytes are guaranteed to
//! be a prefix of a string the grammar accepts. Grammar regions marked
//! hidden are parsed but never emitted; named captures and optional
//! log-probs arrive on the terminating chunk. When the grammar leaves only
//! one continuation, tokens are forced without consulting the oracle at
//! all.
//!
//! ```no_run
//! # use tokengate::{DecodeOptions, TokenStream, Vocabulary};
//! # fn demo<P, O>(parser_for: impl FnOnce(&[u8]) -> P, oracle: O) -> anyhow::Result<()>
//! # where P: tokengate::CommitParser, O: tokengate::LogitOracle {
//! let tokens: Vec<Vec<u8>> = vec![b"<s>".to_vec(), b"a".to_vec(), b"b".to_vec()];
//! let mut vocab = Vocabulary::new(tokens, 0, None)?;
//! let stream = TokenStream::new(&mut vocab, b"say: ", oracle, DecodeOptions::default(), parser_for)?;
//! for chunk in stream {
//!     let chunk = chunk?;
//!     print!("{}", String::from_utf8_lossy(&chunk.bytes));
//! }
//! # Ok(())
//! # }
//! ```

pub mod captures;
pub mod decoder;
pub mod sampler;
pub mod vocab;

pub use decoder::{Chunk, DecodeOptions, TokenStream};
pub use vocab::Vocabulary;

pub use tokengate_core::{
    ByteMask, ByteTrie, CommitParser, CommitPoint, DecodeError, InnerNode, LogitOracle, ParseTree,
    TerminalNode, TokenId,
};
