pub mod api;
pub mod cli;
pub mod fs;
pub mod fuse;
pub mod logging;
pub mod mount;
pub mod socket;

pub use api::{
    Api, ApiBackend, ApiError, ApiErrorCode, HttpBackend, InMemoryBackend, RemoteState,
    SharedRemoteState,
};
pub use fs::{Attributes, DirListEntry, Engine, EngineOptions, FsError, NodeId, ROOT_ID};
pub use fuse::CgFuse;
pub use socket::{ControlListener, ControlServer};
