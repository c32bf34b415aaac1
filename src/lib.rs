pub mod cli;
pub mod config;
pub mod env;
pub mod index_query;
pub mod indexer;
pub mod model;
pub mod params;
pub mod policy;
pub mod protocol;
pub mod pylit;
pub mod router;
pub mod shape;
pub mod transport;
