pub mod fanout;
pub mod kpi;
pub mod model;
pub mod service;
pub mod window;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use service::{ResearchService, ServiceOptions};
pub use worker::{Disposition, ResearchWorker, WorkerOptions};
