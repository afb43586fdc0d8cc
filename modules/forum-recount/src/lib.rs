pub mod aggregate;
pub mod config;
pub mod error;
pub mod recount;
pub mod reporter;
pub mod resolve;
pub mod run_log;
pub mod service;
pub mod snapshot;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use aggregate::{aggregate, Aggregate, AggregateEntry, AggregateKey, FirstPostIndex, Sighting};
pub use config::{BackendConfig, HostContext, RecountConfig};
pub use error::{RecountError, Result};
pub use recount::{RecountPipeline, RunProgress, Stage};
pub use reporter::{build_payload, Ack, BackendReporter};
pub use resolve::{partition, IdLookup, ResolveStats, Resolver};
pub use run_log::{EventKind, LogSink, RunEvent, RunLog};
pub use service::RecountService;
pub use snapshot::{build_snapshot, Snapshot, SnapshotMeta, SnapshotSlot};
