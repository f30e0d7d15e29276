//! Binary entry point for `txfs`.

use std::process;

fn main() {
    if let Err(e) = txfs::run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
