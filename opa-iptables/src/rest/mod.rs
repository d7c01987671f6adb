//! HTTP control surface.

mod handlers;
mod routes;

pub use handlers::{ApiError, AppState, RuleOpResponse};
pub use routes::{ApiDoc, create_router};
