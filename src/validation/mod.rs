//! Transaction model, signing, and verification

mod transaction;

pub use transaction::*;
