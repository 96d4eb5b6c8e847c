#![doc = include_str!("../README.md")]

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod inmemory;
pub mod job;
pub mod metadata;
pub mod topology;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, MalformedMessageError, Message};

#[doc(inline)]
pub use metadata::{Metadata, ValidationError};

#[doc(inline)]
pub use inmemory::InMemoryBroker;

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use topology::{ChannelTopology, Topology, TopologyError, TopologyErrorKind};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerHook, ConsumerRunError, ConsumerRunErrorKind, DefaultConsumerHook,
    Dispatch, FailureRoute, HandlerError, Outcome,
};
