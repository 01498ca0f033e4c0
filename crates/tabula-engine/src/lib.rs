//! Tabula Engine crate - runtime-schema tables over the SQLite store.
//!
//! Hosts the schema catalog service, payload validation, the query planner,
//! lookup resolution, the search collaborator contract, the authorization
//! decorator and the [`TableEngine`] facade tying them together.

pub mod auth;
pub mod catalog;
pub mod engine;
pub mod planner;
pub mod resolver;
pub mod search;
pub mod validator;

pub use auth::{Action, AllowAll, AuthDecision, Authorized, Authorizer, Scope};
pub use engine::{Engine, EngineContext, TableEngine};
pub use planner::{QueryPlan, SortKey};
pub use search::{NoopSearch, SearchIndexer};
