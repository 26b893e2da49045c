//! Database repositories, one module per table

pub mod batches;
pub mod classifications;
pub mod prompts;
pub mod validations;
