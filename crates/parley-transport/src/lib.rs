//! # parley-transport
//!
//! Backend connectivity for the Parley message hub.
//!
//! - **[`Backend`]** - a message table plus an optional push channel
//! - **[`Adapter`]** - drives one backend, preferring push and degrading to
//!   polling without losing or repeating messages
//! - **[`MemoryBackend`]** - in-process loopback backend
//! - **`SupabaseBackend`** - PostgREST + realtime websocket (feature
//!   `supabase`)
//!
//! ```rust,ignore
//! use parley_transport::{Adapter, MemoryBackend, SyncSettings};
//!
//! let adapter = Adapter::new(Arc::new(MemoryBackend::new()), SyncSettings::default());
//! adapter.set_sink(sink);
//! adapter.connect().await?;
//! ```

pub mod adapter;
pub mod cursor;
mod fallback;
pub mod memory;
pub mod presence;
pub mod traits;

#[cfg(feature = "supabase")]
pub mod supabase;

use std::sync::Arc;

pub use adapter::{Adapter, AdapterState, EventSink, SyncSettings};
pub use cursor::{Observation, SyncCursor};
pub use fallback::MIN_POLL_INTERVAL;
pub use memory::{MemoryBackend, PushMode};
pub use presence::{Identity, PresenceTracker, VirtualParticipant};
pub use traits::{
    Activity, Backend, BackendError, BackendKind, Credentials, NewRow, PresenceMeta,
    PushEvent, PushSubscription, StoredRow, VersionInfo, HEARTBEAT_CONTENT,
};

#[cfg(feature = "supabase")]
pub use supabase::SupabaseBackend;

/// Build the backend for `kind`.
///
/// Returns `Ok(None)` for [`BackendKind::None`].
///
/// # Errors
///
/// Returns `Misconfigured` if credentials are missing or the kind was
/// compiled out.
pub fn build_backend(
    kind: BackendKind,
    credentials: Option<&Credentials>,
) -> Result<Option<Arc<dyn Backend>>, BackendError> {
    match kind {
        BackendKind::None => Ok(None),
        BackendKind::Memory => Ok(Some(Arc::new(MemoryBackend::new()))),
        #[cfg(feature = "supabase")]
        BackendKind::Supabase => {
            let credentials = credentials.ok_or_else(|| {
                BackendError::Misconfigured("supabase credentials missing".into())
            })?;
            Ok(Some(Arc::new(SupabaseBackend::new(credentials)?)))
        }
        #[cfg(not(feature = "supabase"))]
        BackendKind::Supabase => {
            let _ = credentials;
            Err(BackendError::Misconfigured(
                "built without supabase support".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_backend() {
        assert!(build_backend(BackendKind::None, None).unwrap().is_none());
        let memory = build_backend(BackendKind::Memory, None).unwrap().unwrap();
        assert_eq!(memory.kind(), BackendKind::Memory);
        assert!(build_backend(BackendKind::Supabase, None).is_err());
    }
}
