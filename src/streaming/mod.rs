//! Durable file output for query pages and bulk result sets.
//!
//! Every file is written to a temporary sibling and renamed into place, so
//! a reader never observes a partially written page or result.

mod atomic_writer;

pub use atomic_writer::{stream_to_file, write_atomic, AtomicFileWriter};
