//! Persistence: tabular data files with table-key headers, the
//! stimulus index, session path generation and the storage thread.

pub mod index;
pub mod paths;
pub mod tablekey;
pub mod writer;

pub use index::StimulusIndexWriter;
pub use paths::PathTemplate;
pub use tablekey::TableKey;
pub use writer::{StorageCommand, StorageThread};
