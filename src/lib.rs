pub mod arbiter;
pub mod config;
pub mod listen;
pub mod models;
pub mod probe;
pub mod receiver;
pub mod report;
pub mod segmenter;
pub mod stats;
pub mod trial;
