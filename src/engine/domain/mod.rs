pub mod effects;
pub mod events;
pub mod identity;
pub mod policy;
pub mod runs;
