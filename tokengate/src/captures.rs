//! Capture extraction from the final parse tree.

use rustc_hash::FxHashMap;
use tokengate_core::ParseTree;

/// Post-order walk collecting named captures and their log-probs. When
/// log-probs were not tracked, every captured key maps to `None`.
pub fn extract_captures(
    tree: &ParseTree,
    byte_data: &[u8],
    with_log_probs: bool,
) -> (FxHashMap<String, Vec<u8>>, FxHashMap<String, Option<f64>>) {
    let mut data = FxHashMap::default();
    let mut log_probs = FxHashMap::default();
    record_captures(tree, &mut data, &mut log_probs, byte_data, 0);
    if !with_log_probs {
        for v in log_probs.values_mut() {
            *v = None;
        }
    }
    (data, log_probs)
}

fn record_captures(
    item: &ParseTree,
    data: &mut FxHashMap<String, Vec<u8>>,
    log_probs: &mut FxHashMap<String, Option<f64>>,
    byte_data: &[u8],
    mut byte_pos: usize,
) {
    match item {
        ParseTree::Terminal(t) => {
            if let Some(name) = &t.capture_name {
                data.insert(name.clone(), t.bytes.clone());
                log_probs.insert(name.clone(), Some(0.0));
            }
        }
        ParseTree::Node(n) => {
            if let Some(name) = &n.capture_name {
                let span = byte_data.get(byte_pos..n.end).unwrap_or(&[]);
                data.insert(name.clone(), span.to_vec());
                log_probs.insert(name.clone(), Some(n.log_prob));
            }
            for child in &n.children {
                record_captures(child, data, log_probs, byte_data, byte_pos);
                byte_pos = match child {
                    // terminals advance by their length; internal children
                    // position us at their span's end
                    ParseTree::Terminal(t) => byte_pos + t.len(),
                    ParseTree::Node(c) => c.end,
                };
            }
        }
    }
}
