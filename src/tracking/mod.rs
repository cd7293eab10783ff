//! The capture side: re-entrancy guard, managed-stack mirror, and the
//! session orchestrator.

pub(crate) mod guard;
pub mod shadow;
pub mod tracker;
