fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CSI proto (Identity and Node subset of the official spec).
    // The relay client comes from the iscsi-relay crate.
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
