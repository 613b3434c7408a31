pub mod channel;
pub mod store;

#[cfg(test)]
mod store_tests;
