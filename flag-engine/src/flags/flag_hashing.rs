use sha1::{Digest, Sha1};

use crate::flags::flag_models::MultivariateFlagVariant;

const LONG_SCALE: u64 = 0xfffffffffffffff;

/// Deterministic hash of `{prefix}{identifier}{salt}` onto [0, 1).
///
/// Uses the first 8 bytes of the SHA-1 digest shifted right by 4 bits, which
/// is the first 15 hex characters of the digest, divided by the largest
/// 15-hex-digit value. The prefix is `"{flag_key}."` for per-flag hashing and
/// `"holdout-"` for the cross-flag holdout bucket.
pub fn calculate_hash(prefix: &str, hashed_identifier: &str, salt: &str) -> f64 {
    let hash_key = format!("{prefix}{hashed_identifier}{salt}");
    let digest = Sha1::digest(hash_key.as_bytes());
    let hash_val: u64 = u64::from_be_bytes(
        digest[..8]
            .try_into()
            .expect("SHA-1 digests are 20 bytes long"),
    ) >> 4;
    hash_val as f64 / LONG_SCALE as f64
}

/// One variant's slice of the hash space.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantInterval {
    pub key: String,
    pub value_min: f64,
    pub value_max: f64,
}

/// Builds contiguous half-open `[value_min, value_max)` intervals from the
/// variants' rollout percentages, in input order.
pub fn variant_lookup_table(variants: &[MultivariateFlagVariant]) -> Vec<VariantInterval> {
    let mut value_min = 0.0;
    variants
        .iter()
        .map(|variant| {
            let value_max = value_min + variant.rollout_percentage / 100.0;
            let interval = VariantInterval {
                key: variant.key.clone(),
                value_min,
                value_max,
            };
            value_min = value_max;
            interval
        })
        .collect()
}

/// First interval containing the hash, or `None` when the percentages sum to
/// less than 100 and the hash falls past the last interval.
pub fn variant_for_hash(table: &[VariantInterval], hash: f64) -> Option<String> {
    table
        .iter()
        .find(|interval| hash >= interval.value_min && hash < interval.value_max)
        .map(|interval| interval.key.clone())
}
