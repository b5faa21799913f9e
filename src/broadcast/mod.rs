pub mod coalescer;
pub mod registry;

pub use coalescer::run_coalescer;
pub use registry::{ConsumerId, ConsumerTransport, SubscriberRegistry};
