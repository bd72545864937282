fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=../broker/proto/hookrelay.proto");

    tonic_build::compile_protos("../broker/proto/hookrelay.proto")?;

    Ok(())
}
