pub mod http;
pub mod tcp;

pub use http::build_client;
pub use tcp::{BoxedStream, Connector, StreamReader, StreamWriter};
