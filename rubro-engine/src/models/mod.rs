//! Domain models for the classification pipeline

mod batch;
mod checkpoint;
mod classification;
mod iteration;
mod prompt;
mod record;
mod validation;

pub use batch::{Batch, BatchStatus, BatchSummary};
pub use checkpoint::Checkpoint;
pub use classification::{Classification, AMBIGUOUS_SCORE, INDETERMINADO};
pub use iteration::Iteration;
pub use prompt::{Category, Prompt};
pub use record::{clean_column_name, FieldValue, Record};
pub use validation::{Feedback, Validation};
