mod broker;
mod consumer;
mod group_consume;
mod message;
pub mod network;
mod producer;
mod service;
mod utils;

pub use broker::{GroupState, MemoryBroker, MemoryTransport};
pub use consumer::{Consumer, ConsumerState};
pub use group_consume::{ConsumerGroupState, GroupCoordinatorClient, PollTracker};
pub use message::{
    Batch, ConsumerRecord, PartitionOffset, PollResult, RebalanceCause, RebalanceEvent, Record,
    TopicPartition,
};
pub use network::{BrokerTransport, EndpointState, ErrorCode, Session, TransportError};
pub use producer::{partition_for_key, DeliveryFuture, DeliveryResult, Partitioner, Producer};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClientConfig, ConsumerConfig,
    ErrorContext, ErrorKind, ProducerConfig, ResetPolicy, SessionConfig, Shutdown, ENV_PREFIX,
};
pub use utils::ExponentialBackoff;
