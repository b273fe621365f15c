//! # policy-engine
//!
//! Access-control decisions for agent platforms.  Policies hold ordered
//! rules; bindings attach policies to scopes (organization, environment,
//! agent, tool, role, user or resource namespace) with a priority.  Every
//! request is resolved against the bindings that match its scope and the
//! first rule whose action, target pattern and conditions match decides.
//! Anything that does not match is denied.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use policy_engine::{loader, Action, EvalRequest, PolicyEvaluator, PolicyStore};
//!
//! let bundle = loader::load_bundle("policies.yaml").unwrap();
//! let store = Arc::new(PolicyStore::new());
//! let report = store.reload_bundle(&bundle);
//! assert!(report.is_clean());
//!
//! let evaluator = PolicyEvaluator::new(store);
//! let req = EvalRequest::new(Action::ToolInvoke, "tool:finance/send_invoice", "org-1")
//!     .with_environment("prod");
//! let result = evaluator.evaluate(&req).unwrap();
//! println!("{:?}: {}", result.decision, result.reason);
//! ```

pub mod catalog;
mod clock;
pub mod condition;
mod decision;
mod evaluator;
pub mod loader;
pub mod matcher;
mod request;
pub mod resolver;
mod schema;
pub mod store;

// Re-export primary public API at crate root.
pub use catalog::{CatalogError, PolicyCatalog};
pub use clock::{Clock, FixedClock, SystemClock};
pub use decision::{BindingTrace, Decision, EvalResult, MatchedRule};
pub use evaluator::PolicyEvaluator;
pub use request::{EvalContext, EvalError, EvalRequest};
pub use schema::{
    Action, Declared, Effect, Policy, PolicyBinding, PolicyBundle, PolicyRule, ScopeType,
    TargetFamily, UnknownName,
};
pub use store::{PolicySet, PolicyStore, ReloadReport, ValidationError, ValidationErrorKind};
