fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/hookrelay.proto");
    tonic_build::compile_protos("proto/hookrelay.proto")?;
    Ok(())
}
