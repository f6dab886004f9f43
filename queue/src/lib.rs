pub mod inspect_queue;

pub use inspect_queue::{CapacityGate, InspectQueue, QueueEntry, QueueHandler};
