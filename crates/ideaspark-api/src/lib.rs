pub mod admin;
pub mod auth;
pub mod cache;
pub mod conversations;
pub mod error;
pub mod generation;
pub mod mailer;
pub mod middleware;
pub mod queue;
pub mod reply;
pub mod routes;
pub mod service;
pub mod state;

pub use error::AppError;
pub use routes::router;
pub use state::{AppState, AppStateInner};
