pub mod bus;
pub mod credentials;
pub mod dedup;
pub mod dispatcher;
pub mod manager;
pub mod state_machine;
pub mod transport;
pub mod undo;
