//! Library wrapper around the `kiln` binary.
//!
//! Compiling `main.rs` as a module lets `cargo test -p kiln-cli --lib`
//! typecheck the CLI without building the integration suite.

#[allow(dead_code)]
#[path = "main.rs"]
mod main_bin;
