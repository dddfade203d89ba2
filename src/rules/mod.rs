//! Declarative rule evaluation.
//!
//! Rules are data: predicate trees evaluated against a flat decision
//! context, producing ALLOW, DENY, or MODIFY. No code execution, no side
//! effects.

pub mod engine;
pub mod logic;

pub use engine::{Rule, RuleContext, RuleDecision, RuleEngine, RuleRecord, RuleResult};
pub use logic::Expr;
