//! The constrained decoding loop.
//!
//! Each outer step accepts at most one token. While the grammar allows
//! exactly one next byte we push bytes without consulting the model; once
//! there is a choice, we ask the oracle for logits and try candidate
//! tokens in sampling order, walking the trie and the parser together.
//! Hidden grammar spans roll back any tokens that overlap them before
//! those tokens' bytes were ever emitted.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use tokengate_core::{
    ByteMask, CommitParser, CommitPoint, DecodeError, LogitOracle, NodeId, TokenId, ROOT,
};

use crate::captures::extract_captures;
use crate::sampler::{log_softmax, Sampler};
use crate::vocab::Vocabulary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Upper bound on emitted-content tokens.
    pub max_tokens: usize,
    /// Number of parallel generations; only 1 is supported.
    pub n: usize,
    /// Nucleus truncation; only 1.0 is supported.
    pub top_p: f64,
    /// 0 samples greedily, > 0 samples from the softmax.
    pub temperature: f64,
    /// Prepend the BOS token's bytes when the prompt lacks them.
    pub ensure_bos_token: bool,
    /// Track per-byte log-probs and report them on captures.
    pub log_probs: bool,
    /// RNG seed for `temperature > 0`; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            max_tokens: 100,
            n: 1,
            top_p: 1.0,
            temperature: 0.0,
            ensure_bos_token: true,
            log_probs: false,
            seed: None,
        }
    }
}

/// One emitted span of output bytes.
///
/// `captures` and `capture_log_probs` populate only on the terminating
/// record; intermediate records carry empty maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub bytes: Vec<u8>,
    pub is_generated: bool,
    pub log_prob: f64,
    pub captures: FxHashMap<String, Vec<u8>>,
    pub capture_log_probs: FxHashMap<String, Option<f64>>,
}

enum Step {
    Continue,
    Yield(Chunk),
    Final(Chunk),
}

enum Outcome {
    /// Grammar plus trie admit exactly one token; no oracle call.
    Forced(TokenId),
    /// Grammar dead end with nothing forced.
    NoToken,
    /// A sampled candidate was accepted, possibly only partially when the
    /// grammar already matched.
    Sampled {
        token: TokenId,
        consumed: usize,
        len: usize,
    },
    /// Every candidate was rejected, or the model deviated after a full
    /// grammar match.
    Stalled,
}

/// Grammar-constrained token stream over a parser and an oracle.
///
/// Borrows the vocabulary mutably for the life of the stream: the trie's
/// match cache is scribbled on in place, so one vocabulary serves one
/// decode at a time (clone it for concurrent decodes).
pub struct TokenStream<'v, P, O> {
    vocab: &'v mut Vocabulary,
    parser: P,
    oracle: O,
    sampler: Sampler,
    opts: DecodeOptions,
    token_ids: Vec<TokenId>,
    token_byte_positions: Vec<usize>,
    hidden_count: usize,
    generated_pos: usize,
    token_count: usize,
    done: bool,
    cand_buf: Vec<u8>,
    logprob_buf: Vec<f64>,
}

impl<'v, P: CommitParser, O: LogitOracle> TokenStream<'v, P, O> {
    /// Assemble the prompt (prepending BOS when asked and missing), build
    /// the parser over it via `build_parser`, and return the stream. The
    /// parser must accept `prompt + grammar`; the grammar itself is the
    /// builder's business.
    pub fn new<F>(
        vocab: &'v mut Vocabulary,
        prompt: &[u8],
        oracle: O,
        opts: DecodeOptions,
        build_parser: F,
    ) -> Result<Self, DecodeError>
    where
        F: FnOnce(&[u8]) -> P,
    {
        if opts.n != 1 {
            return Err(DecodeError::Unsupported(format!("n = {}", opts.n)));
        }
        if opts.temperature > 0.0 && opts.top_p != 1.0 {
            return Err(DecodeError::Unsupported(format!("top_p = {}", opts.top_p)));
        }
        if opts.temperature < 0.0 {
            return Err(DecodeError::Unsupported(format!(
                "temperature = {}",
                opts.temperature
            )));
        }
        let mut prompt = prompt.to_vec();
        if opts.ensure_bos_token && !prompt.starts_with(vocab.bos_bytes()) {
            let mut with_bos = vocab.bos_bytes().to_vec();
            with_bos.extend_from_slice(&prompt);
            prompt = with_bos;
        }
        let parser = build_parser(&prompt);
        let sampler = Sampler::new(opts.temperature, opts.seed);
        let hidden_count = prompt.len();
        Ok(TokenStream {
            vocab,
            parser,
            oracle,
            sampler,
            opts,
            token_ids: Vec::new(),
            token_byte_positions: Vec::new(),
            hidden_count,
            generated_pos: 0,
            token_count: 0,
            done: false,
            cand_buf: Vec::new(),
            logprob_buf: Vec::new(),
        })
    }

    /// Token ids accepted so far.
    pub fn token_ids(&self) -> &[TokenId] {
        &self.token_ids
    }

    /// Cumulative byte-end of each accepted token.
    pub fn token_byte_positions(&self) -> &[usize] {
        &self.token_byte_positions
    }

    fn step(&mut self) -> Result<Step, DecodeError> {
        let start_pos = self.parser.pos();
        self.vocab.trie_mut().bump_match_version();
        let mut node = ROOT;
        let mut mask_count;

        // Forced descent: while exactly one byte is legal, push it through
        // without consulting the model.
        loop {
            let mask = self.parser.next_byte_mask();
            mask_count = mask.num_set();
            if mask_count != 1 {
                break;
            }
            let mut next = None;
            for i in 0..self.vocab.trie().num_children(node) {
                let (b, child) = self.vocab.trie().child_by_index(node, i);
                let legal = mask.is_allowed(b);
                self.vocab.trie_mut().set_match(child, legal);
                if legal {
                    next = Some((b, child));
                    break;
                }
            }
            // the unique legal byte has no continuation at this trie
            // position: the token ending here is forced
            let Some((b, child)) = next else { break };
            let commit = self.parser.consume_byte(b, 0.0);
            node = child;
            if let Some(cp) = commit {
                if cp.hidden {
                    self.hidden_rewind(start_pos, &cp);
                    return Ok(Step::Continue);
                }
            }
        }
        let mut forced_pos = self.parser.pos();

        // back off to a token boundary when the descent overshot one
        if mask_count <= 1 {
            while self.vocab.trie().token_at(node).is_none() {
                let Some(parent) = self.vocab.trie().parent_of(node) else {
                    break;
                };
                node = parent;
                forced_pos -= 1;
            }
            self.parser.set_pos(forced_pos);
        }

        let matched = self.parser.matched();
        let is_forced = mask_count <= 1
            && if matched {
                self.vocab.trie().num_children(node) == 0
            } else {
                node != ROOT
            };

        let mut new_bytes_log_prob = 0.0f64;
        let outcome = if is_forced {
            match self.vocab.trie().token_at(node) {
                Some(t) => {
                    log::trace!("forced token {}", self.vocab.token_dbg(t));
                    Outcome::Forced(t)
                }
                // the back-off stops at a token or the root; nothing to force
                None => Outcome::NoToken,
            }
        } else if mask_count == 0 {
            Outcome::NoToken
        } else {
            self.sample(start_pos, forced_pos, node, &mut new_bytes_log_prob)?
        };

        // everything new that is certain not to be hidden
        let ehs = self.parser.earliest_hidden_start();
        let new_bytes: Vec<u8> = self
            .parser
            .bytes()
            .get(self.generated_pos..ehs)
            .unwrap_or(&[])
            .to_vec();

        let (token, token_len) = match outcome {
            Outcome::NoToken | Outcome::Stalled => {
                // nothing was accepted, so there is no token to register
                // even when the cursor sits mid-trie; flush what the
                // grammar covers and finish
                return Ok(Step::Final(self.final_chunk(new_bytes, new_bytes_log_prob)));
            }
            Outcome::Sampled { consumed, len, .. } if consumed < len && node == ROOT => {
                // the model ran off the end of the grammar; emit what the
                // grammar still covers and finish
                return Ok(Step::Final(self.final_chunk(new_bytes, new_bytes_log_prob)));
            }
            Outcome::Forced(t) => (t, self.vocab.token(t).len()),
            Outcome::Sampled { token, len, .. } => (token, len),
        };

        self.generated_pos += new_bytes.len();
        let out = new_bytes.get(self.hidden_count..).unwrap_or(&[]);
        let result = if out.is_empty() {
            self.hidden_count -= new_bytes.len();
            None
        } else {
            let chunk = Chunk {
                bytes: out.to_vec(),
                is_generated: !is_forced,
                log_prob: new_bytes_log_prob,
                captures: FxHashMap::default(),
                capture_log_probs: FxHashMap::default(),
            };
            self.hidden_count = 0;
            self.token_count += 1;
            Some(chunk)
        };
        self.token_ids.push(token);
        let last = self.token_byte_positions.last().copied().unwrap_or(0);
        self.token_byte_positions.push(last + token_len);
        log::trace!(
            "accepted {} (forced: {}), pos {}",
            self.vocab.token_dbg(token),
            is_forced,
            self.parser.pos()
        );
        Ok(match result {
            Some(c) => Step::Yield(c),
            None => Step::Continue,
        })
    }

    /// Ask the oracle, then try candidates in sampling order until one
    /// survives the joint trie/grammar walk.
    fn sample(
        &mut self,
        start_pos: usize,
        forced_pos: usize,
        node: NodeId,
        new_bytes_log_prob: &mut f64,
    ) -> Result<Outcome, DecodeError> {
        let logits = self.oracle.logits(&self.token_ids);
        if logits.len() != self.vocab.vocab_size() {
            return Err(DecodeError::OracleShape {
                got: logits.len(),
                want: self.vocab.vocab_size(),
            });
        }
        if self.opts.log_probs {
            log_softmax(&logits, &mut self.logprob_buf);
            self.vocab.trie_mut().compute_log_probs(&self.logprob_buf);
        }

        let mut order = self.sampler.order(&logits);
        let mut outcome = Outcome::Stalled;
        let mut tried = 0usize;
        while let Some(cand) = self.sampler.next_candidate(&mut order) {
            tried += 1;
            self.parser.set_pos(forced_pos);
            *new_bytes_log_prob = 0.0;
            self.cand_buf.clear();
            self.cand_buf.extend_from_slice(self.vocab.token(cand));

            // a candidate must extend the forced byte prefix
            if start_pos < forced_pos {
                let prefix = &self.parser.bytes()[start_pos..forced_pos];
                if !self.cand_buf.starts_with(prefix) {
                    continue;
                }
            }
            let offset = forced_pos - start_pos;
            let cand_len = self.cand_buf.len();
            let mut token_pos = offset;
            let mut walk = node;
            let mut rejected = false;
            let mut left_trie = false;
            while token_pos < cand_len {
                let b = self.cand_buf[token_pos];
                let Some(next) = self.vocab.trie().child_at_byte(walk, b) else {
                    left_trie = true;
                    break;
                };
                if !self.vocab.trie().is_fresh(next) {
                    // one mask query refreshes the whole sibling set
                    let mask = self.parser.next_byte_mask();
                    self.vocab.trie_mut().refresh_children(walk, &mask);
                }
                if self.vocab.trie().mask_match(next) {
                    let delta =
                        self.vocab.trie().log_prob(next) - self.vocab.trie().log_prob(walk);
                    *new_bytes_log_prob += delta;
                    self.parser.consume_byte(b, delta);
                    walk = next;
                    token_pos += 1;
                } else {
                    // a partial token is fine past the end of the grammar
                    if !self.parser.matched() {
                        rejected = true;
                    }
                    break;
                }
            }
            if left_trie {
                continue;
            }
            if !rejected && token_pos == cand_len && !self.parser.matched() {
                let mask = self.parser.next_byte_mask();
                if check_dominated(self.vocab, &mut self.parser, walk, &mask) {
                    rejected = true;
                }
            }
            if !rejected && token_pos > 0 {
                log::debug!(
                    "sampled {} after {} candidates",
                    self.vocab.token_dbg(cand),
                    tried
                );
                outcome = Outcome::Sampled {
                    token: cand,
                    consumed: token_pos,
                    len: cand_len,
                };
                break;
            }
            if self.parser.matched() {
                // full grammar match and the model is deviating: stop
                break;
            }
        }
        if matches!(outcome, Outcome::Stalled) {
            // drop any bytes a rejected candidate left behind
            self.parser.set_pos(forced_pos);
            log::debug!("no candidate fit after {} tried", tried);
        }
        Ok(outcome)
    }

    fn hidden_rewind(&mut self, start_pos: usize, cp: &CommitPoint) {
        self.parser.commit_and_collapse(cp);
        if start_pos < cp.start {
            self.parser.shadow_rewind(start_pos);
        } else {
            // drop every token that overlaps the hidden span; none of their
            // bytes past the hidden start were emitted
            while self
                .token_byte_positions
                .last()
                .map_or(false, |&end| end > cp.start)
            {
                self.token_ids.pop();
                self.token_byte_positions.pop();
                self.token_count = self.token_count.saturating_sub(1);
            }
            // popping everything leaves no boundary to return to
            let back = self.token_byte_positions.last().copied().unwrap_or(0);
            self.parser.shadow_rewind(back);
        }
        log::debug!(
            "hidden span at {}: rewound, {} tokens live",
            cp.start,
            self.token_ids.len()
        );
    }

    fn final_chunk(&mut self, new_bytes: Vec<u8>, log_prob: f64) -> Chunk {
        let (captures, capture_log_probs) = if self.parser.matched() {
            let tree = self.parser.parse_tree();
            extract_captures(&tree, self.parser.bytes(), self.opts.log_probs)
        } else {
            log::debug!("stream ended without a grammar match");
            Default::default()
        };
        let bytes = new_bytes.get(self.hidden_count..).unwrap_or(&[]).to_vec();
        Chunk {
            bytes,
            is_generated: true,
            log_prob,
            captures,
            capture_log_probs,
        }
    }
}

impl<'v, P: CommitParser, O: LogitOracle> Iterator for TokenStream<'v, P, O> {
    type Item = Result<Chunk, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.token_count >= self.opts.max_tokens {
                self.done = true;
                return None;
            }
            match self.step() {
                Ok(Step::Continue) => continue,
                Ok(Step::Yield(c)) => return Some(Ok(c)),
                Ok(Step::Final(c)) => {
                    self.done = true;
                    return Some(Ok(c));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// A fully-matching candidate is dominated when every grammar-legal
/// extension stays inside the trie on a path to some longer token: greedy
/// retokenization would then never produce the shorter candidate.
fn check_dominated<P: CommitParser>(
    vocab: &mut Vocabulary,
    parser: &mut P,
    node: NodeId,
    mask: &ByteMask,
) -> bool {
    let curr = parser.pos();
    for b in mask.iter() {
        let Some(child) = vocab.trie().child_at_byte(node, b) else {
            // the grammar can leave the trie here
            return false;
        };
        if !vocab.trie().is_fresh(child) {
            vocab.trie_mut().set_match(child, mask.is_allowed(b));
        }
        if !vocab.trie().mask_match(child) {
            return false;
        }
        if vocab.trie().token_at(child).is_none() {
            parser.consume_byte(b, 0.0);
            let sub = parser.next_byte_mask();
            let dominated = check_dominated(vocab, parser, child, &sub);
            parser.set_pos(curr);
            if !dominated {
                return false;
            }
        }
    }
    true
}
