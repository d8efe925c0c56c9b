fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The gRPC stubs are vendored in `src/pb` to avoid depending on protoc
    // in CI.
    //
    // To regenerate from the proto files:
    // - Uncomment the following lines.
    // - Run `cargo build` to regenerate the stubs.
    // - Comment the following lines.
    // - Commit the changes.
    // tonic_build::configure()
    //     .out_dir("src/pb")
    //     .compile_protos(
    //         &[
    //             "proto/highpress/common/v1/common.proto",
    //             "proto/highpress/counter/v1/counter.proto",
    //             "proto/highpress/analytics/v1/analytics.proto",
    //         ],
    //         &["proto"],
    //     )?;
    Ok(())
}
