fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CSI proto (from official CSI spec). Client stubs are used by
    // the end-to-end tests that dial the running driver.
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
