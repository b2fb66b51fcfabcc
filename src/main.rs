//! mixweave builds a music-similarity index from audio embeddings and
//! synthesises ordered playlists from it.

mod aggregate;
mod audio;
mod cli;
mod embed;
mod error;
mod features;
mod generate;
mod m3u;
mod reorder;
mod scan;
mod store;
mod vecmath;

use crate::error::Error;

fn main() {
    env_logger::init();
    if let Err(err) = cli::run() {
        eprintln!("Error: {err}");
        if matches!(err, Error::Usage(_)) {
            eprintln!("Use --help for usage.");
        }
        std::process::exit(1);
    }
}
