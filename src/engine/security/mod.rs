pub mod authz;
pub mod claims;
pub mod middleware;
pub mod token;
