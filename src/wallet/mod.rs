//! Wallet key provider and on-disk wallet file

mod wallet;

pub use wallet::*;
