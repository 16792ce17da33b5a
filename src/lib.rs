pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod routes;

pub use routes::api_routes;
