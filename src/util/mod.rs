//! Shared utilities: addresses, constants, logging, and the option system.

pub mod address;
pub mod constants;
pub mod logger;
#[macro_use]
pub mod options;
pub mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
