pub use batch::{Batch, PollResult, RebalanceCause, RebalanceEvent};
pub use record::{ConsumerRecord, Record};
pub use topic_partition::{PartitionOffset, TopicPartition};

mod batch;
mod record;
mod topic_partition;
