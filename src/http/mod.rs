//! HTTP layer of the knot: the signed internal API plus the unsigned
//! health and metrics endpoints.

pub mod handler;

pub use handler::{create_router, AppError};
