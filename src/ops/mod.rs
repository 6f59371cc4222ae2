pub mod interface;
pub mod path_mapping;
pub mod storages;
