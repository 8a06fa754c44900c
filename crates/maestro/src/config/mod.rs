//! Service file configuration parsing and validation

mod service_file;

pub use service_file::*;
