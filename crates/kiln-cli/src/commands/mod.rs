pub mod cluster;
pub mod query;
