//! Command-line entry point for `umoci`.

// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

fn run() -> Result<()> {
    umoci_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        if umoci_lib::cli::error_is_permission_denied(&e) {
            eprintln!("hint: this looks like a permission problem; try --rootless");
        }
        std::process::exit(1);
    }
}
