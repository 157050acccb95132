pub mod capability;
pub mod local;
pub mod memory;

pub use capability::{
    CloudError, CloudSession, CloudStorage, CompletedUpload, LinkedFile, PublicLink, Quota,
    RemoteFile,
};
pub use local::LocalCloud;
pub use memory::{CallRecord, InMemoryCloud, Operation};
