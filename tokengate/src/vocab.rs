//! The vocabulary: token byte table, BOS/EOS ids, and the byte trie built
//! over it.

use tokengate_core::bytes::limit_bytes;
use tokengate_core::{ByteTrie, DecodeError, TokenId};

#[derive(Clone)]
pub struct Vocabulary {
    tokens: Vec<Vec<u8>>,
    trie: ByteTrie,
    bos_token_id: TokenId,
    eos_token_id: TokenId,
}

impl Vocabulary {
    /// `eos_token_id` defaults to `bos_token_id` when absent.
    pub fn new(
        tokens: Vec<Vec<u8>>,
        bos_token_id: TokenId,
        eos_token_id: Option<TokenId>,
    ) -> Result<Self, DecodeError> {
        if tokens.is_empty() {
            return Err(DecodeError::Vocabulary("empty vocabulary".to_string()));
        }
        let eos_token_id = eos_token_id.unwrap_or(bos_token_id);
        for (name, id) in [("bos", bos_token_id), ("eos", eos_token_id)] {
            if id as usize >= tokens.len() {
                return Err(DecodeError::Vocabulary(format!(
                    "{} token id {} out of range for vocabulary of {}",
                    name,
                    id,
                    tokens.len()
                )));
            }
        }
        let trie = ByteTrie::from_tokens(tokens.iter().map(|t| t.as_slice()));
        log::debug!(
            "vocabulary: {} tokens, {} trie nodes, max token len {}",
            tokens.len(),
            trie.node_count(),
            trie.max_token_len()
        );
        Ok(Vocabulary {
            tokens,
            trie,
            bos_token_id,
            eos_token_id,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> &[u8] {
        self.tokens
            .get(id as usize)
            .map(|t| t.as_slice())
            .unwrap_or(&[])
    }

    pub fn bos_token_id(&self) -> TokenId {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    pub fn bos_bytes(&self) -> &[u8] {
        self.token(self.bos_token_id)
    }

    pub fn max_token_len(&self) -> usize {
        self.trie.max_token_len()
    }

    pub fn trie(&self) -> &ByteTrie {
        &self.trie
    }

    pub(crate) fn trie_mut(&mut self) -> &mut ByteTrie {
        &mut self.trie
    }

    /// Greedy longest-match retokenization of `bytes`.
    pub fn greedy_tokenize(&self, bytes: &[u8]) -> Vec<TokenId> {
        self.trie.greedy_tokenize(bytes)
    }

    pub fn token_dbg(&self, id: TokenId) -> String {
        if id as usize >= self.tokens.len() {
            format!("OOB[{}]", id)
        } else if self.tokens[id as usize].is_empty() {
            format!("EMPTY[{}]", id)
        } else {
            limit_bytes(&self.tokens[id as usize], 32)
        }
    }

    pub fn tokens_dbg(&self, ids: &[TokenId]) -> String {
        ids.iter()
            .map(|&t| self.token_dbg(t))
            .collect::<Vec<_>>()
            .join("\u{2027}")
    }
}
