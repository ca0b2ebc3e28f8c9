//! Finalizer marker bookkeeping.
//!
//! `kube::runtime::finalizer` needs an `Api<K>`; these helpers go through
//! the [`Store`] instead so the same lifecycle runs against any backend.

use kube::ResourceExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{Managed, Store};

pub fn has<K: Managed>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add `finalizer` if missing and persist.  Returns the stored object,
/// which is `obj` itself when nothing had to change.
pub async fn ensure<K: Managed, S: Store>(store: &S, obj: &K, finalizer: &str) -> Result<K> {
    if has(obj, finalizer) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().push(finalizer.to_string());
    debug!(name = %obj.name_any(), %finalizer, "adding finalizer");
    store.replace(&updated).await
}

/// Remove `finalizer` and persist.  A NotFound race on this final write
/// means the object is already gone, which is the goal.
pub async fn remove<K: Managed, S: Store>(store: &S, obj: &K, finalizer: &str) -> Result<()> {
    if !has(obj, finalizer) {
        return Ok(());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().retain(|f| f != finalizer);
    debug!(name = %obj.name_any(), %finalizer, "removing finalizer");
    match store.replace(&updated).await {
        Ok(_) | Err(Error::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
