//! Configurations sized for in-process tests

use llmq_core::{LlmqConfig, LlmqParams, LlmqType};

/// Three-member regression quorum
pub fn test_params() -> LlmqParams {
    LlmqParams::preset(LlmqType::LlmqTest)
}

/// Five members, threshold three
pub fn five_member_params() -> LlmqParams {
    let mut params = LlmqParams::preset(LlmqType::LlmqTest);
    params.size = 5;
    params.min_size = 3;
    params.threshold = 3;
    params.dkg_bad_votes_threshold = 3;
    params
}

/// Every topic signed by one quorum type
pub fn config_for(params: LlmqParams) -> LlmqConfig {
    let mut config = LlmqConfig::single_type(params);
    config.bls_worker_threads = 1;
    config.worker_queue_capacity = 4096;
    config
}

/// Single-type configuration over `test_params`
pub fn test_config() -> LlmqConfig {
    config_for(test_params())
}
