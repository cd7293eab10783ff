//! Native-address handling: segment tracking, stack capture, and deferred
//! symbolification.

pub mod segments;
pub mod symbolize;
pub(crate) mod unwind;
