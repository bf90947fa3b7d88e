//! Identity swap: replace a provisional entity with its server counterpart.

use async_trait::async_trait;

use crate::models::{Collection, EntityId, Note, SwapMapping};
use crate::services::SyncContext;
use crate::store::StoreCommand;
use crate::Result;

/// Hook for components that key live state by note id.
///
/// `before_note_swap` runs ahead of the database rewrite and may abort the
/// swap by failing. Exactly one of `after_note_swap` (rewrite committed) or
/// `abort_note_swap` (rewrite failed) follows a successful `before_note_swap`.
#[async_trait]
pub trait SwapListener: Send + Sync {
    async fn before_note_swap(&self, mapping: &SwapMapping) -> Result<()>;

    async fn after_note_swap(&self, mapping: &SwapMapping);

    async fn abort_note_swap(&self, mapping: &SwapMapping);
}

/// Replace `local_id` with `remote` in storage, live sessions and the store.
///
/// With identical ids this is a plain update in place.
pub async fn swap_note(ctx: &SyncContext, local_id: &EntityId, remote: Note) -> Result<SwapMapping> {
    let mapping = SwapMapping::new(local_id.clone(), remote.id.clone());
    let listener = ctx.swap_listener.as_ref().filter(|_| !mapping.is_identity());

    if let Some(listener) = listener {
        listener.before_note_swap(&mapping).await?;
    }
    if let Err(error) = ctx.local.swap_note(local_id, &remote).await {
        if let Some(listener) = listener {
            listener.abort_note_swap(&mapping).await;
        }
        return Err(error);
    }
    if let Some(listener) = listener {
        listener.after_note_swap(&mapping).await;
    }

    if !mapping.is_identity() {
        tracing::info!(from = %mapping.from, to = %mapping.to, "Swapped note identity");
    }
    ctx.store.apply(StoreCommand::SwapNote {
        from: local_id.clone(),
        note: remote,
    });
    Ok(mapping)
}

/// Replace `local_id` with `remote`; notes inside the collection follow.
pub async fn swap_collection(
    ctx: &SyncContext,
    local_id: &EntityId,
    remote: Collection,
) -> Result<SwapMapping> {
    let mapping = SwapMapping::new(local_id.clone(), remote.id.clone());
    let moved = ctx.local.swap_collection(local_id, &remote).await?;
    if !mapping.is_identity() {
        tracing::info!(
            from = %mapping.from,
            to = %mapping.to,
            notes = moved,
            "Swapped collection identity"
        );
    }
    ctx.store.apply(StoreCommand::SwapCollection {
        from: local_id.clone(),
        collection: remote,
    });
    Ok(mapping)
}
