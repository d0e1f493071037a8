fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server for the relay binary, client for the CSI node plugin
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../proto/iscsi_relay.proto"], &["../proto"])?;

    Ok(())
}
