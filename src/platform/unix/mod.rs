//! Unix backend: domain sockets and POSIX shared memory.

mod frame;
mod shm;
mod socket;

pub(crate) use frame::MAX_FRAME_LEN as MAX_MESSAGE_SIZE;
pub(crate) use shm::SharedRegion;
pub(crate) use socket::{
    AccessDescriptor, ClientStream, PlatformEndpoint, connect, create_endpoints,
};
