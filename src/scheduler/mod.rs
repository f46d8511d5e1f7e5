pub mod dispatcher;
pub mod job;
pub mod selector;
pub mod stats;
pub mod store;

pub use dispatcher::{Dispatcher, SubmitRequest, Submission};
pub use job::{Job, JobLogEntry, JobReport, JobState, NewJob, Script};
pub use selector::{rank_candidates, WorkerSelector};
pub use stats::{DailyCount, KpiWindow, WorkerKpi};
pub use store::{JobListing, JobPage, JobQuery, JobStore};
