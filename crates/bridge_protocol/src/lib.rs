pub mod codec;
pub mod message;

pub use message::{Blob, ConversionRequest, ErrorKind, Outbound, OCTET_STREAM};
