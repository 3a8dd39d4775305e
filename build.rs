use prost::Message;
use std::path::PathBuf;

const PROTOS: [&str; 2] = ["proto/detection.proto", "proto/recognition.proto"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    // Parsed in-process, no protoc binary required
    let descriptors = protox::compile(PROTOS, ["proto"])?;
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("detector_descriptor.bin");
    std::fs::write(&descriptor_path, descriptors.encode_to_vec())?;

    tonic_build::configure()
        .build_server(false)
        .bytes(["."])
        .skip_protoc_run()
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(&PROTOS, &["proto"])?;
    Ok(())
}
