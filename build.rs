fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "grpc")]
    tonic_build::configure()
        .build_server(false)
        .compile_protos(&["proto/agent.proto"], &["proto"])?;
    Ok(())
}
