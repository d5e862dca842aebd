use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{Document, FileAsset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Update,
    Delete,
}

/// The ownership facts a capability check needs.
#[derive(Debug, Clone, Copy)]
pub enum Resource {
    /// Notes are private to their owner; superusers get no bypass.
    Note { owner_id: Uuid },
    File { owner_id: Uuid, is_public: bool },
}

impl From<&Document> for Resource {
    fn from(document: &Document) -> Self {
        Resource::Note {
            owner_id: document.owner_id,
        }
    }
}

impl From<&FileAsset> for Resource {
    fn from(asset: &FileAsset) -> Self {
        Resource::File {
            owner_id: asset.owner_id,
            is_public: asset.is_public,
        }
    }
}

pub fn authorize(principal: Option<&Principal>, resource: Resource, action: Action) -> bool {
    match resource {
        Resource::Note { owner_id } => {
            principal.is_some_and(|p| p.is_active && p.user_id == owner_id)
        }
        Resource::File {
            owner_id,
            is_public,
        } => {
            if action == Action::Read && is_public {
                return true;
            }
            principal.is_some_and(|p| p.is_active && (p.is_superuser || p.user_id == owner_id))
        }
    }
}

pub fn ensure(principal: Option<&Principal>, resource: Resource, action: Action) -> AppResult<()> {
    if authorize(principal, resource, action) {
        Ok(())
    } else {
        Err(AppError::forbidden("not permitted to access this resource"))
    }
}
