//! Read-only HTTP status API for the operator

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::OperatorState;
