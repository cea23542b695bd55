//! Run orchestration engine: run lifecycle, job dispatch, scoped tokens,
//! policy, event fan-out, credential re-resolution and the undo ledger.

pub mod api;
pub mod domain;
pub mod persistence;
pub mod queue;
pub mod runtime;
pub mod security;
pub mod tools;
