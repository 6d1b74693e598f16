//! Converge a single object toward its desired state
//!
//! [`ensure_desired_state`] is the create-or-update primitive every deploy
//! step goes through. The caller supplies an identity object (name and
//! namespace set, nothing else needed) and a `mutate` function that maps the
//! observed object to the desired one. `mutate` receives the identity object
//! when nothing exists yet, and the fetched object otherwise, so fields it
//! doesn't touch survive.
//!
//! Writes are version-checked. A conflict re-fetches and re-applies
//! `mutate` instead of overwriting.

use tracing::{debug, info, warn};

use crate::store::{from_value, to_value, ResourceKey, ResourceStore, StoredResource};
use crate::{Error, Result};

/// Attempts before a conflict is surfaced to the caller
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// What [`ensure_desired_state`] did to the remote object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Object did not exist and was created
    Created,
    /// Object existed and differed from the desired state
    Updated,
    /// Object already matched; no write was issued
    Unchanged,
}

/// Result of converging an object
#[derive(Clone, Debug)]
pub struct Ensured<K> {
    /// The object as stored after the operation
    pub object: K,
    /// What happened
    pub operation: Operation,
}

/// Create or update `identity` so that it equals `mutate(observed)`
pub async fn ensure_desired_state<K, F>(
    store: &dyn ResourceStore,
    identity: K,
    mutate: F,
) -> Result<Ensured<K>>
where
    K: StoredResource,
    F: Fn(K) -> Result<K>,
{
    let key = ResourceKey::from_object(&identity)?;
    let mut last_conflict = None;

    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let outcome = match store.get(&key).await? {
            None => {
                let desired = mutate(identity.clone())?;
                check_identity(&key, &desired)?;
                store
                    .create(&key, to_value(&desired)?)
                    .await
                    .map(|stored| (stored, Operation::Created))
            }
            Some(value) => {
                let observed: K = from_value(value)?;
                let desired = mutate(observed.clone())?;
                check_identity(&key, &desired)?;
                if desired == observed {
                    debug!(resource = %key, "already in desired state");
                    return Ok(Ensured {
                        object: observed,
                        operation: Operation::Unchanged,
                    });
                }
                store
                    .update(&key, to_value(&desired)?)
                    .await
                    .map(|stored| (stored, Operation::Updated))
            }
        };

        match outcome {
            Ok((stored, operation)) => {
                info!(resource = %key, ?operation, "reconciled");
                return Ok(Ensured {
                    object: from_value(stored)?,
                    operation,
                });
            }
            Err(e) if e.is_conflict() => {
                warn!(resource = %key, attempt, error = %e, "conflict, re-fetching");
                last_conflict = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_conflict.unwrap_or_else(|| {
        Error::conflict_for(&key.kind, key.qualified_name(), "retries exhausted")
    }))
}

/// `mutate` must not move the object to another identity
fn check_identity<K: StoredResource>(key: &ResourceKey, desired: &K) -> Result<()> {
    let meta = desired.meta();
    if meta.name.as_deref() != Some(key.name.as_str()) || meta.namespace != key.namespace {
        return Err(Error::validation_for(
            key.to_string(),
            "mutate changed the object's name or namespace",
        ));
    }
    Ok(())
}

/// Delete an object by identity, returning false if it was already gone
pub async fn delete_if_exists<K: StoredResource>(
    store: &dyn ResourceStore,
    name: &str,
    namespace: Option<&str>,
) -> Result<bool> {
    let key = ResourceKey::of::<K>(name, namespace);
    match store.delete(&key).await {
        Ok(true) => {
            info!(resource = %key, "deleted");
            Ok(true)
        }
        Ok(false) => {
            debug!(resource = %key, "already absent");
            Ok(false)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
