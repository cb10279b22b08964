// Carfeed Infra - AMQP Transport
// lapin-backed implementation of the broker ports

mod connector;

pub use connector::{LapinConnector, LapinSession};
