use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "??".to_string());

    let Ok(out_dir) = env::var("OUT_DIR") else {
        panic!("OUT_DIR is not set");
    };
    let dest_path = Path::new(&out_dir).join("version.rs");
    if let Err(err) = fs::write(
        dest_path,
        format!(r#"pub const VERSION: &str = "{}";"#, version),
    ) {
        panic!("Failed to write version.rs: {err}");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
