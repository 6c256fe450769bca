//! The `service` module holds the read-side and cloud-side components. They
//! talk to the hub's service endpoint and never touch a device session.

pub mod commands;
pub mod feedback;
pub mod reader;

pub use commands::CommandSender;
pub use feedback::FeedbackCollector;
pub use reader::PartitionedReader;
