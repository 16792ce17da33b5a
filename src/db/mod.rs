pub mod generation_records;
pub mod subscribers;
