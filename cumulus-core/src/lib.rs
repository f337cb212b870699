mod backoff;
mod client;

pub use backoff::Backoff;
pub use client::{
    ApiError, CloudClient, DirInfo, DirListing, ErrorClass, ObjectProps, ProgressCallback,
    RemoteDir, RemoteEventRecord, RemoteFile, DIR_CREATED_EVENT, DIR_MOVED_EVENT,
    DIR_REMOVED_EVENT, FILE_MOVED_EVENT, FILE_REMOVED_EVENT, FILE_UPLOADED_EVENT,
    SYSTEM_PARENT_ID, TRASH_PARENT_ID,
};
