pub mod chunk_writer;
pub mod file_store;
pub mod metadata;
pub mod session;
pub mod session_store;
