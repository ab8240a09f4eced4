pub mod grpc {
    pub use tonic::metadata;
    pub use tonic::Code;
    pub use tonic::Request;
    pub use tonic::Status;
}
pub mod cancel {
    pub use tokio_util::sync::CancellationToken;
}
pub mod retry;
