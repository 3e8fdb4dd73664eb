//! kiln gRPC API
//!
//! This crate defines the gRPC protocol spoken between a kiln build worker
//! and the build manager. The protobuf definitions live in
//! `proto/buildman.proto` and are code-generated via `tonic-build`.

// Include the generated code
pub mod buildman {
    pub mod v1 {
        tonic::include_proto!("buildman.v1");
    }
}
