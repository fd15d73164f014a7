pub mod matcher;
pub mod overrides;

pub use matcher::{BlocklistSnapshot, MatchKind, MatchResult, Matcher, Whitelist};
pub use overrides::Overrides;
