pub mod flag_cache;
pub mod flag_group_type_mapping;
pub mod flag_hashing;
pub mod flag_match_reason;
pub mod flag_matching;
pub mod flag_matching_utils;
pub mod flag_models;
pub mod flag_service;
pub mod hash_key_overrides;

#[cfg(test)]
mod test_flag_matching;
