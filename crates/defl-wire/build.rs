use std::path::PathBuf;

// Compiles proto/defl.proto into the prost-generated message types
// `include!`-d at the root of `defl-wire::lib`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    prost_build::Config::new()
        .out_dir(&out_dir)
        .compile_protos(&["proto/defl.proto"], &["proto/"])?;
    println!("cargo:rerun-if-changed=proto/defl.proto");
    Ok(())
}
