fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fast-Path proto — server stubs only (clients connect to us).
    let file_descriptor_set = protox::compile(
        ["proto/fastsandbox/fastpath/v1/fastpath.proto"],
        ["proto"],
    )?;

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_fds(file_descriptor_set)?;

    Ok(())
}
