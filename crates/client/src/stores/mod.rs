//! Client-side stores for query state.

pub mod query_store;

pub use query_store::{Fetcher, QuerySnapshot, QueryStore};
