//! The logit oracle: the model behind the decoder.

use crate::bytes::TokenId;

/// Given the accepted token-id prefix, return logits over the vocabulary.
///
/// The returned vector must be exactly the vocabulary size; the decoder
/// checks and reports a shape violation otherwise. Out-of-range ids in
/// `token_ids` are a programming error on the decoder's side, not a
/// condition the oracle reports.
pub trait LogitOracle {
    fn logits(&mut self, token_ids: &[TokenId]) -> Vec<f32>;
}

impl<O: LogitOracle + ?Sized> LogitOracle for &mut O {
    fn logits(&mut self, token_ids: &[TokenId]) -> Vec<f32> {
        (**self).logits(token_ids)
    }
}
