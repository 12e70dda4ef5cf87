//! CloakChat client endpoint.
//!
//! Everything the broker must never see lives here: plaintext, pairwise
//! and channel keys, and file contents. The endpoint encrypts before
//! anything touches the wire and decrypts after it leaves it; the host UI
//! consumes [`events::ClientEvent`]s and calls the command methods on
//! [`endpoint::EndpointCore`] / [`session::ClientSession`].

pub mod endpoint;
pub mod error;
pub mod events;
pub mod session;
pub mod transfer;

pub use endpoint::EndpointCore;
pub use error::ClientError;
pub use events::ClientEvent;
pub use session::ClientSession;
pub use transfer::{FileMetadata, TransferManager};
