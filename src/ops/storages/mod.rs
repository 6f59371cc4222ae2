pub mod local_fs;
pub mod memory;
pub mod object_store;
