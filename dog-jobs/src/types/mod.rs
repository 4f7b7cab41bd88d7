pub mod ids;
pub mod state;
pub mod options;
pub mod record;
pub mod events;

pub use ids::JobId;
pub use state::{JobState, JobCounts};
pub use options::JobOptions;
pub use record::{JobRecord, NewJob, Transition};
pub use events::JobEvent;
