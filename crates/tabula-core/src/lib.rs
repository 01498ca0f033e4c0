pub mod config;
pub mod error;
pub mod expr;
pub mod types;
pub mod value;

pub use config::TabulaConfig;
pub use error::{Result, TabulaError};
pub use expr::Expr;
pub use types::*;
pub use value::{CanonicalValue, Values};
