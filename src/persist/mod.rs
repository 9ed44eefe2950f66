//! Outbound persistence: snapshot sink, match finalizer and request signing

pub mod finalizer;
pub mod lifecycle;
pub mod sigv4;
pub mod sink;

pub use finalizer::{FinalizeError, InvocationType, LambdaFinalizer, MatchFinalizer, StoreFinalizer};
pub use lifecycle::MatchLifecycle;
pub use sigv4::{Credentials, SigV4Signer, SignError};
pub use sink::{AppSyncSink, SinkError, SnapshotSink};
