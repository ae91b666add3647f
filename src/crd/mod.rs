pub mod cluster;
pub mod replica;
pub mod task;

pub use cluster::{ClusterState, PgCluster, PgClusterSpec, PgClusterStatus, StorageSpec};
pub use replica::{PgReplica, PgReplicaSpec, PgReplicaStatus};
pub use task::{PgTask, PgTaskSpec, PgTaskStatus, TaskState, TaskType};
