pub mod spool;

pub use spool::SpoolFile;
