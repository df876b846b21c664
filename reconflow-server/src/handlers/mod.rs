pub mod assets;
pub mod scans;
pub mod strategies;
pub mod tasks;
