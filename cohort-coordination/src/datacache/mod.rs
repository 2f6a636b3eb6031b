//! Shared data cache and array transfer
//!
//! The coordinator keeps one dataset resident at a time and serves array
//! slices of it to workers, either as copies or as handles into shared
//! segments when the transport offers them.

pub mod array;
pub mod cache;
pub mod client;
pub mod messages;
pub mod transfer;

pub use array::{ArrayData, DType, SharedArrayHandle};
pub use cache::{Availability, Dataset, DatasetLoader, SharedDataCache};
pub use client::DatasetConnection;
pub use transfer::{receive_array, send_array, ArrayHeader, TransferMode};
