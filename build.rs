fn main() -> Result<(), Box<dyn std::error::Error>> {
    // No system `protoc` binary is available in this environment, so compile
    // the .proto files with the pure-Rust `protox` parser instead and hand
    // prost/tonic the resulting FileDescriptorSet (re-encoded through the
    // prost-types version prost-build/tonic-build expect).
    let fds = protox::compile(["proto/replication.proto"], ["proto"])?;
    let fds = {
        use protox::prost::Message as _;
        fds.encode_to_vec()
    };
    let fds = {
        use prost::Message as _;
        prost_types::FileDescriptorSet::decode(fds.as_slice())?
    };

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(fds)?;
    Ok(())
}
