use thiserror::Error;

use crate::cluster::ClusterError;

/// A session resource that could not be removed.
///
/// Never fatal on its own: the orchestrator reports it so the operator can
/// delete the leaked object by hand.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("unable to delete namespace {name:?}. manual deletion is required: {source}")]
    Namespace {
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error(
        "unable to delete tracer pod {name:?} from namespace {namespace:?}. manual deletion is required: {source}"
    )]
    Pod {
        namespace: String,
        name: String,
        #[source]
        source: ClusterError,
    },
}
