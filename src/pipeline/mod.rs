//! Run orchestration: the per-table exporter and the run-level coordinator

pub mod coordinator;
pub mod exporter;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{Coordinator, RunConfig};
pub use exporter::ExportSettings;
