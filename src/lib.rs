pub mod aggregation;
pub mod backlog;
pub mod calculators;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod storage;
