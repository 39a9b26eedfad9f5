//! Rendition.
//!
//! Rendition resolves URLs, file paths and bundled asset references to decoded images. Concurrent
//! requests for the same resource share a single fetch, and results are kept in a memory cache
//! and a persistent cache on disk.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
