//! Exclusive resource holds scoped to one transaction.
//!
//! A [`LockedResource`] can only be obtained from [`ResourceLock`], so code
//! that takes one as a parameter is statically known to run after the hold
//! was taken. Conflict checks and availability changes require it.

use std::collections::BTreeMap;

use tracing::{debug, instrument, warn};

use crate::errors::{Missing, WorkflowResult};
use crate::resource::{Resource, ResourceChange};
use crate::store::{HolderRef, StoreTransaction};
use crate::types::ResourceId;

/// Proof that a resource row is held exclusively by the current transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedResource {
    resource: Resource,
}

impl LockedResource {
    /// The resource as read under the hold.
    pub const fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Its identifier.
    pub const fn id(&self) -> &ResourceId {
        &self.resource.id
    }
}

/// Acquires resource holds through a store transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLock;

impl ResourceLock {
    /// Holds one resource until the transaction ends.
    ///
    /// Blocks while another transaction holds it. Fails with `NotFound` when
    /// the resource does not exist.
    #[instrument(skip(self, tx), fields(resource = %id))]
    pub async fn acquire<T: StoreTransaction>(
        &self,
        tx: &mut T,
        id: &ResourceId,
    ) -> WorkflowResult<LockedResource> {
        let resource = tx
            .lock_resource(id)
            .await?
            .ok_or_else(|| Missing::Resource(id.clone()))?;
        debug!("[lock.acquire] resource held");
        Ok(LockedResource { resource })
    }

    /// Holds every resource in `ids`, in ascending identifier order.
    ///
    /// Two transactions that overlap on any resource therefore always
    /// contend on the lowest shared identifier first and cannot deadlock on
    /// each other. Duplicates are held once.
    pub async fn acquire_all<'a, T, I>(
        &self,
        tx: &mut T,
        ids: I,
    ) -> WorkflowResult<BTreeMap<ResourceId, LockedResource>>
    where
        T: StoreTransaction,
        I: IntoIterator<Item = &'a ResourceId>,
    {
        let mut ordered: Vec<&ResourceId> = ids.into_iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut held = BTreeMap::new();
        for id in ordered {
            let locked = self.acquire(tx, id).await?;
            held.insert(id.clone(), locked);
        }
        Ok(held)
    }

    /// The open batch with a line on a held resource.
    pub async fn holder<T: StoreTransaction>(
        &self,
        tx: &mut T,
        locked: &LockedResource,
    ) -> WorkflowResult<Option<HolderRef>> {
        Ok(tx.open_holder(locked.id()).await?)
    }

    /// Applies an availability change to a held resource.
    ///
    /// Returns `false`, leaving the resource untouched, when it is no longer
    /// in the state the change expects.
    pub async fn apply<T: StoreTransaction>(
        &self,
        tx: &mut T,
        locked: &mut LockedResource,
        change: &ResourceChange,
    ) -> WorkflowResult<bool> {
        if locked.resource.status != change.from {
            warn!(
                resource = %locked.id(),
                expected = %change.from,
                actual = %locked.resource.status,
                "[lock.apply] resource moved out of band; leaving it as is"
            );
            return Ok(false);
        }
        tx.set_resource_status(locked.id(), change.to).await?;
        locked.resource.status = change.to;
        Ok(true)
    }
}
