pub mod internal;
pub mod routes;
pub mod sse;

pub use routes::build_router;
