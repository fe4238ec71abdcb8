pub mod comparator;
pub mod context;
pub mod engine;
pub mod entry;
pub mod filter;
pub mod gate;
pub mod properties;
pub mod report;
pub mod scanner;
pub mod task;
pub mod transfer;

pub use comparator::{CompareConfig, FileComparator, FileRelation, MergeSummary, TaskSink};
pub use context::SyncContext;
pub use engine::SyncEngine;
pub use entry::{Entry, Listed, Side, SkipReason, StorageClass};
pub use filter::{FilterRule, PathFilter};
pub use gate::{ColdStoragePolicy, GateDecision, StorageClassGate};
pub use properties::{CopyPropsMode, Properties, PropertyKey, PropertyPropagator};
pub use report::{
    describe_outcome, ExitClass, ResultCollector, RunResult, TaskObserver, TaskOutcome,
    TracingObserver,
};
pub use scanner::{FileScanner, ListStream};
pub use task::{Direction, Endpoint, MetadataRefresh, Task, TaskKind};
pub use transfer::{plan_parts, RetryPolicy, TransferConfig, TransferExecutor};
