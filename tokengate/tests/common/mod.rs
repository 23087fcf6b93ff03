//! Test doubles: a scripted segment grammar behind the parser seam, and
//! oracles with canned preferences.

#![allow(dead_code)]

use tokengate::Vocabulary;
use tokengate_core::{
    ByteMask, CommitParser, CommitPoint, InnerNode, LogitOracle, ParseTree, TerminalNode, TokenId,
};

#[derive(Clone)]
pub enum Seg {
    /// Fixed bytes.
    Lit(Vec<u8>),
    /// Fixed bytes that are parsed but hidden from the output.
    Hidden(Vec<u8>),
    /// One of several fixed alternatives (kept unambiguous in tests).
    Choice(Vec<Vec<u8>>),
    /// One-or-more bytes of a class, captured under a name. Final segment
    /// only.
    Capture { name: String, class: fn(u8) -> bool },
    /// Any bytes, forever. Final segment only.
    Any,
}

pub fn lit(s: &str) -> Seg {
    Seg::Lit(s.as_bytes().to_vec())
}

pub fn hidden(s: &str) -> Seg {
    Seg::Hidden(s.as_bytes().to_vec())
}

pub fn choice(alts: &[&str]) -> Seg {
    Seg::Choice(alts.iter().map(|a| a.as_bytes().to_vec()).collect())
}

pub fn capture(name: &str, class: fn(u8) -> bool) -> Seg {
    Seg::Capture {
        name: name.to_string(),
        class,
    }
}

pub fn any() -> Seg {
    Seg::Any
}

/// Deterministic segment-sequence grammar. Byte-level semantics follow the
/// parser contract: `bytes()` holds exactly the accepted bytes, a hidden
/// segment produces a commit point on its final byte, and collapsing it
/// removes its bytes and shrinks it to zero width for every later parse.
pub struct ScriptParser {
    segs: Vec<Seg>,
    resolved: Vec<bool>,
    accepted: Vec<u8>,
    lps: Vec<f64>,
}

impl ScriptParser {
    pub fn new(segs: Vec<Seg>) -> Self {
        let resolved = vec![false; segs.len()];
        ScriptParser {
            segs,
            resolved,
            accepted: Vec::new(),
            lps: Vec::new(),
        }
    }

    /// Grammar for `prompt` followed by `segs`, as the decoder's parser
    /// builder expects.
    pub fn with_prompt(prompt: &[u8], segs: Vec<Seg>) -> Self {
        let mut all = Vec::with_capacity(segs.len() + 1);
        if !prompt.is_empty() {
            all.push(Seg::Lit(prompt.to_vec()));
        }
        all.extend(segs);
        Self::new(all)
    }

    fn matches_fixed(&self, bytes: &[u8], pos: usize, seg: usize, full: bool, s: &[u8]) -> bool {
        let rest = &bytes[pos..];
        if rest.len() < s.len() {
            !full && s.starts_with(rest)
        } else {
            rest[..s.len()] == *s && self.matches(bytes, pos + s.len(), seg + 1, full)
        }
    }

    /// Whether `bytes[pos..]` parses from segment `seg` onward; `full`
    /// demands a complete match, otherwise any extendable prefix passes.
    fn matches(&self, bytes: &[u8], pos: usize, seg: usize, full: bool) -> bool {
        if !full && pos == bytes.len() {
            return true;
        }
        if seg == self.segs.len() {
            return pos == bytes.len();
        }
        match &self.segs[seg] {
            Seg::Lit(s) => self.matches_fixed(bytes, pos, seg, full, s),
            Seg::Hidden(s) => {
                if self.resolved[seg] {
                    self.matches(bytes, pos, seg + 1, full)
                } else {
                    self.matches_fixed(bytes, pos, seg, full, s)
                }
            }
            Seg::Choice(alts) => alts
                .iter()
                .any(|a| self.matches_fixed(bytes, pos, seg, full, a)),
            Seg::Capture { class, .. } => {
                let rest = &bytes[pos..];
                !rest.is_empty() && rest.iter().all(|&b| class(b))
            }
            Seg::Any => true,
        }
    }

    fn is_prefix(&self, bytes: &[u8]) -> bool {
        self.matches(bytes, 0, 0, false)
    }

    /// Byte range each segment occupies in `accepted` (greedy walk);
    /// segments past the input sit at zero width.
    fn boundaries(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.segs.len());
        let mut pos = 0;
        for (i, seg) in self.segs.iter().enumerate() {
            let avail = self.accepted.len() - pos;
            let len = match seg {
                Seg::Lit(s) => s.len().min(avail),
                Seg::Hidden(s) => {
                    if self.resolved[i] {
                        0
                    } else {
                        s.len().min(avail)
                    }
                }
                Seg::Choice(alts) => {
                    let rest = &self.accepted[pos..];
                    let mut best = 0;
                    for a in alts {
                        let n = a.len().min(rest.len());
                        if a[..n] == rest[..n] {
                            best = best.max(n);
                        }
                    }
                    best
                }
                Seg::Capture { class, .. } => self.accepted[pos..]
                    .iter()
                    .take_while(|&&b| class(b))
                    .count(),
                Seg::Any => avail,
            };
            out.push((pos, pos + len));
            pos += len;
        }
        out
    }
}

impl CommitParser for ScriptParser {
    fn pos(&self) -> usize {
        self.accepted.len()
    }

    fn set_pos(&mut self, pos: usize) {
        self.accepted.truncate(pos);
        self.lps.truncate(pos);
    }

    fn bytes(&self) -> &[u8] {
        &self.accepted
    }

    fn next_byte_mask(&mut self) -> ByteMask {
        let mut mask = ByteMask::new();
        let mut probe = self.accepted.clone();
        probe.push(0);
        for b in 0..=255u8 {
            if let Some(last) = probe.last_mut() {
                *last = b;
            }
            if self.matches(&probe, 0, 0, false) {
                mask.allow(b);
            }
        }
        mask
    }

    fn consume_byte(&mut self, byte: u8, log_prob: f64) -> Option<CommitPoint> {
        self.accepted.push(byte);
        self.lps.push(log_prob);
        debug_assert!(self.is_prefix(&self.accepted), "illegal byte consumed");
        let bounds = self.boundaries();
        for (i, seg) in self.segs.iter().enumerate() {
            if let Seg::Hidden(s) = seg {
                let (start, end) = bounds[i];
                if !self.resolved[i] && end == self.accepted.len() && end - start == s.len() {
                    return Some(CommitPoint {
                        start,
                        hidden: true,
                        capture_name: None,
                    });
                }
            }
        }
        None
    }

    fn shadow_rewind(&mut self, pos: usize) {
        // semantics only; the re-play optimization is the real parser's
        self.set_pos(pos);
    }

    fn commit_and_collapse(&mut self, cp: &CommitPoint) {
        let bounds = self.boundaries();
        for (i, seg) in self.segs.iter().enumerate() {
            if matches!(seg, Seg::Hidden(_)) && !self.resolved[i] && bounds[i].0 == cp.start {
                self.resolved[i] = true;
                self.accepted.truncate(cp.start);
                self.lps.truncate(cp.start);
                return;
            }
        }
        panic!("no unresolved hidden span at {}", cp.start);
    }

    fn matched(&self) -> bool {
        self.matches(&self.accepted, 0, 0, true)
    }

    fn earliest_hidden_start(&self) -> usize {
        let bounds = self.boundaries();
        for (i, seg) in self.segs.iter().enumerate() {
            if matches!(seg, Seg::Hidden(_)) && !self.resolved[i] {
                return bounds[i].0;
            }
        }
        self.accepted.len()
    }

    fn parse_tree(&self) -> ParseTree {
        let bounds = self.boundaries();
        let mut children = Vec::new();
        for (i, seg) in self.segs.iter().enumerate() {
            let (start, end) = bounds[i];
            match seg {
                Seg::Hidden(_) => {}
                Seg::Capture { name, .. } => {
                    let lp: f64 = self.lps[start..end].iter().sum();
                    children.push(ParseTree::Node(InnerNode {
                        capture_name: Some(name.clone()),
                        end,
                        log_prob: lp,
                        children: vec![ParseTree::Terminal(TerminalNode {
                            bytes: self.accepted[start..end].to_vec(),
                            capture_name: None,
                        })],
                    }));
                }
                Seg::Lit(_) | Seg::Choice(_) | Seg::Any => {
                    children.push(ParseTree::Terminal(TerminalNode {
                        bytes: self.accepted[start..end].to_vec(),
                        capture_name: None,
                    }));
                }
            }
        }
        ParseTree::Node(InnerNode {
            capture_name: None,
            end: self.accepted.len(),
            log_prob: 0.0,
            children,
        })
    }
}

/// Oracle with per-call preference rankings; the last ranking repeats once
/// the list runs out. Unranked tokens share one low logit, so greedy order
/// falls back to ascending ids among them.
pub struct RankedOracle {
    vocab_size: usize,
    rounds: Vec<Vec<TokenId>>,
    pub calls: usize,
}

impl RankedOracle {
    pub fn new(vocab_size: usize, rounds: Vec<Vec<TokenId>>) -> Self {
        assert!(!rounds.is_empty());
        RankedOracle {
            vocab_size,
            rounds,
            calls: 0,
        }
    }

    pub fn uniform(vocab_size: usize, ranking: Vec<TokenId>) -> Self {
        Self::new(vocab_size, vec![ranking])
    }
}

impl LogitOracle for RankedOracle {
    fn logits(&mut self, _token_ids: &[TokenId]) -> Vec<f32> {
        let round = &self.rounds[self.calls.min(self.rounds.len() - 1)];
        let mut logits = vec![-10.0f32; self.vocab_size];
        for (rank, &t) in round.iter().enumerate() {
            logits[t as usize] = 10.0 - rank as f32;
        }
        self.calls += 1;
        logits
    }
}

/// Oracle that always returns the wrong number of logits.
pub struct MisshapenOracle(pub usize);

impl LogitOracle for MisshapenOracle {
    fn logits(&mut self, _token_ids: &[TokenId]) -> Vec<f32> {
        vec![0.0; self.0]
    }
}

pub fn vocab(words: &[&[u8]], bos: TokenId) -> Vocabulary {
    let tokens = words.iter().map(|w| w.to_vec()).collect();
    Vocabulary::new(tokens, bos, None).expect("test vocabulary")
}
