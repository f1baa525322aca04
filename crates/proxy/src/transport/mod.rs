pub mod stream;
pub mod tls;

/// Attached to a request's extensions to override the default body-buffering
/// limit used when an interceptor needs to materialize a body (spec §5
/// "`maxBodyBuffer`, default 10 MiB").
#[derive(Clone, Copy, Debug)]
pub struct BufferLimit(pub usize);
