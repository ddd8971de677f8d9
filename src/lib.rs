pub mod bridge;
pub mod codec;
pub mod conn;
pub mod engine;
pub mod error;
pub mod frame;
pub mod group;
pub mod packet;
pub mod periodic;
pub mod protocol;
pub mod tags;
pub mod transport;

pub use conn::{ConnConfig, ConnError, PciAddr, PciConnection};
pub use engine::{
    Completion, Engine, EngineConfig, Events, LinkState, NackPolicy, SendOutcome, StatusOutcome,
};
pub use error::WireError;
pub use frame::RxBuffer;
pub use group::GroupDb;
pub use packet::Packet;
pub use protocol::{Cal, ClockSal, LightingSal, Sal, TemperatureSal};
