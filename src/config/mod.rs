pub mod settings;

pub use settings::{
    CacheSettings, ConditionalForwardingSettings, ConditionalRuleSettings, ConfigHandle,
    RateLimitSettings, Settings,
};
