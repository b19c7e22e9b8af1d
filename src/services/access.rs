//! Who is calling, and whether they may touch an owner's files.
//!
//! The decision itself belongs to the surrounding application; this service
//! only asks a yes/no question through [`AccessPolicy`].

use crate::models::owner::Owner;
use async_trait::async_trait;
use serde::Serialize;

/// The authenticated caller.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub is_admin: bool,
}

impl Actor {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            is_admin: false,
        }
    }

    pub fn admin(id: i64) -> Self {
        Self {
            id,
            is_admin: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    View,
    Edit,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
        }
    }
}

#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn authorize(&self, actor: &Actor, owner: &Owner, action: Action) -> bool;
}

/// Grants everything. Used when an upstream gateway has already decided.
pub struct AllowAll;

#[async_trait]
impl AccessPolicy for AllowAll {
    async fn authorize(&self, _actor: &Actor, _owner: &Owner, _action: Action) -> bool {
        true
    }
}
