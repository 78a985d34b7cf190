pub const FLAG_EVALUATION_ERROR_COUNTER: &str = "flag_evaluation_error_total";
pub const FLAG_CONDITION_STORE_READS_COUNTER: &str = "flag_condition_store_reads_total";
pub const FLAG_HASH_KEY_WRITES_COUNTER: &str = "flag_hash_key_override_writes_total";
pub const FLAG_HASH_KEY_RETRIES_COUNTER: &str = "flag_hash_key_override_retries_total";
pub const FLAG_DEFINITION_CACHE_HIT_COUNTER: &str = "flag_definition_cache_hits_total";
pub const FLAG_DEFINITION_CACHE_MISS_COUNTER: &str = "flag_definition_cache_misses_total";
