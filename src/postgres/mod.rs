pub mod connection;
pub mod decoder;
pub mod provision;
pub mod slot;
pub mod test_utils;
pub mod types;

#[cfg(test)]
mod decoder_tests;

pub use connection::{ManagedClient, SharedClient};
pub use decoder::TestDecodingDecoder;
pub use slot::PostgresSlotSource;
pub use types::*;
