//! Windows backend: message-mode named pipes and named file mappings.

mod pipe;
mod security;
mod shm;

pub(crate) use pipe::{ClientStream, MAX_MESSAGE_SIZE, PlatformEndpoint, connect, create_endpoints};
pub(crate) use security::AccessDescriptor;
pub(crate) use shm::SharedRegion;
