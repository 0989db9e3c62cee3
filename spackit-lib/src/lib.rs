#![doc = include_str!("../README.md")]

mod error;

pub mod aggregate;
pub mod decode;
pub mod layout;
pub mod pipeline;
pub mod registry;
pub mod spacepacket;

pub use error::{Error, Result};
