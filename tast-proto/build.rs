//! Build script for tast-proto
//!
//! Generates gRPC/protobuf bindings during `cargo build`.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    unsafe {
        std::env::set_var(
            "PROTOC",
            protoc_bin_vendored::protoc_bin_path().expect("vendored protoc binary"),
        );
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(
            &["proto/reports.proto", "proto/progress.proto"],
            &["proto"],
        )?;

    Ok(())
}
