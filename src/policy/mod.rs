pub mod engine;

pub use engine::{Action, ActionKind, PolicyContext, PolicyEngine, Rule, RuleExpression};
