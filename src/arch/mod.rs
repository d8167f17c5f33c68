//! Target architecture support. amd64 only.

pub mod trace;
pub mod x64;
