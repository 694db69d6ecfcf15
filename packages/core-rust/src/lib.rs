//! Stack core: service data model, wire frames, codecs and the error taxonomy
//! shared by the client call engine and its collaborators.

pub mod codec;
pub mod error;
pub mod message;
pub mod request;
pub mod types;

pub use codec::{Codec, CodecError, CodecRegistry, Negotiated, Protocol};
pub use error::{CallError, ErrorKind, RemoteError};
pub use message::{Frame, Message, MessageType, Payload, END_OF_STREAM};
pub use request::{Publication, Request, DEFAULT_CONTENT_TYPE};
pub use types::{Node, Service};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {}
}
