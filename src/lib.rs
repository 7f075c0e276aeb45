pub mod accumulate;
pub mod args;
pub mod capture;
pub mod coincidence;
pub mod config;
pub mod detect;
pub mod envelope;
pub mod geom;
pub mod pipeline;
pub mod reference;
pub mod report;
pub mod utils;
