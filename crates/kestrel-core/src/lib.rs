//! # kestrel-core
//! Foundation types, codecs and chain parameters for the Kestrel node.

pub mod compress;
pub mod constants;
pub mod error;
pub mod genesis;
pub mod merkle;
pub mod types;
pub mod work;
