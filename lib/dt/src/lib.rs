#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod error;
pub mod fdt;
pub mod node;
pub mod parse;
pub mod prop;

#[cfg(test)]
mod test_dtb;

pub use error::DtError;
pub use fdt::{Fdt, FdtError};
pub use node::{DeviceTree, Node};
