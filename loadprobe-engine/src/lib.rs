pub mod drift;
pub mod driver;
pub mod metrics;
pub mod presets;
pub mod report;
pub mod scenario;
pub mod threshold;
pub mod workload;
