//! Sampling order over candidate tokens.
//!
//! `temperature == 0` yields the descending argsort of the logits;
//! `temperature > 0` yields categorical draws without replacement from
//! `softmax(logits / temperature)` — the same permutation a single
//! shuffled draw of all indices would produce. The order is consumed
//! lazily: the decoder usually accepts one of the first few candidates.

use std::cmp::Ordering;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use tokengate_core::TokenId;

pub struct Sampler {
    temperature: f64,
    rng: StdRng,
}

pub enum SamplingOrder {
    Greedy { order: Vec<TokenId>, next: usize },
    Multinomial { weights: Vec<f64>, remaining: usize },
}

impl Sampler {
    pub fn new(temperature: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Sampler { temperature, rng }
    }

    pub fn order(&mut self, logits: &[f32]) -> SamplingOrder {
        if self.temperature == 0.0 {
            let mut order: Vec<TokenId> = (0..logits.len() as TokenId).collect();
            order.sort_by(|&a, &b| {
                logits[b as usize]
                    .partial_cmp(&logits[a as usize])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&b))
            });
            SamplingOrder::Greedy { order, next: 0 }
        } else {
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
            let weights: Vec<f64> = logits
                .iter()
                .map(|&l| ((l as f64 - max) / self.temperature).exp())
                .collect();
            let remaining = weights.iter().filter(|&&w| w > 0.0).count();
            SamplingOrder::Multinomial { weights, remaining }
        }
    }

    /// Next token id to try, or `None` once the order is exhausted. Tokens
    /// with zero probability mass never appear in a multinomial order.
    pub fn next_candidate(&mut self, order: &mut SamplingOrder) -> Option<TokenId> {
        match order {
            SamplingOrder::Greedy { order, next } => {
                let r = order.get(*next).copied();
                *next += 1;
                r
            }
            SamplingOrder::Multinomial { weights, remaining } => {
                if *remaining == 0 {
                    return None;
                }
                let dist = WeightedIndex::new(weights.iter().copied()).ok()?;
                let i = dist.sample(&mut self.rng);
                weights[i] = 0.0;
                *remaining -= 1;
                Some(i as TokenId)
            }
        }
    }
}

/// Log-softmax of `logits` into `out`.
pub(crate) fn log_softmax(logits: &[f32], out: &mut Vec<f64>) {
    out.clear();
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    if !max.is_finite() {
        out.extend(logits.iter().map(|_| f64::NEG_INFINITY));
        return;
    }
    let lse = max
        + logits
            .iter()
            .map(|&l| (l as f64 - max).exp())
            .sum::<f64>()
            .ln();
    out.extend(logits.iter().map(|&l| l as f64 - lse));
}
