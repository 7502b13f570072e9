//! Domain types shared by the connection, dedup and crawl layers.

pub mod job;
pub mod message;
pub mod session;
pub mod target;

pub use job::{Job, JobNewEvent, NewJob, ScrapeResult, JOB_STATUS_RAW};
pub use message::{Channel, Message, Topic};
pub use session::{Session, SessionData, SESSION_VERSION};
pub use target::{NewTarget, Target, TargetType};
