//! USB receipt printer driver.
//!
//! Recognizes printers from a catalog of vendor/product profiles, works out
//! which command language they speak, and moves raw bytes to and from them
//! through a [`PrinterSession`](printer::PrinterSession).

pub mod config;
pub mod error;
pub mod platform;
pub mod printer;

pub use error::{PrinterError, PrinterResult};
