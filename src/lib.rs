pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod ground_truth;
pub mod groups;
pub mod harvest;
pub mod page;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod sampler;
pub mod session;
pub mod store;
