//! 执行层：ExecutionController 驱动计划，产出 RunReport

pub mod controller;
pub mod report;

pub use controller::{ExecutionConfig, ExecutionController};
pub use report::RunReport;
