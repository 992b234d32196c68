pub mod address;
pub mod batch;
pub mod cache;
pub mod connection;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod service;
pub mod span;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub(crate) use address::{Address, Options, RegisterType};
pub(crate) use connection::Destination;
pub(crate) use service::*;
