//! Short opaque id generation.
//!
//! Ids are a type prefix plus 10 random lowercase-alphanumeric characters,
//! e.g. `wo_4k9x2mnp7q`. Short enough to paste into a terminal, random
//! enough that collisions within one data directory are not a concern.

use rand::Rng;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 10;

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| {
            let idx = rng.random_range(0..ID_ALPHABET.len());
            ID_ALPHABET[idx] as char
        })
        .collect()
}

/// Generate a new work-order id.
pub fn new_work_order_id() -> String {
    format!("wo_{}", random_suffix())
}

/// Generate a new run id.
pub fn new_run_id() -> String {
    format!("run_{}", random_suffix())
}

/// Generate a new workspace id.
pub fn new_workspace_id() -> String {
    format!("ws_{}", random_suffix())
}
