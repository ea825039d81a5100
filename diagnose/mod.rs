pub mod performance;
pub mod table;
pub use performance::{
    PerformanceSummary, Quartiles, quartiles, reference_maximum, summarize,
};
pub use table::PerformanceTable;
