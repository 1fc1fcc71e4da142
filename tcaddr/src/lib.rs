//! Address utilities for the translation runtime: naming code addresses by the symbols they
//! belong to.

pub mod addr;
