//! Membership service

use std::sync::Arc;

use crate::{
    clock::Clock,
    error::{AppError, AppResult},
    models::member::{Member, MemberStatus, NewMember},
    repository::LibraryStore,
};

#[derive(Clone)]
pub struct MembersService {
    store: Arc<dyn LibraryStore>,
    clock: Arc<dyn Clock>,
}

impl MembersService {
    pub fn new(store: Arc<dyn LibraryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn register(&self, member: NewMember) -> AppResult<Member> {
        if member.name.trim().is_empty() || !member.email.contains('@') {
            return Err(AppError::Validation("a name and a valid email are required".to_string()));
        }

        let mut tx = self.store.begin().await?;
        let created = tx.insert_member(&member, self.clock.now()).await?;
        tx.commit().await?;

        tracing::info!("Member {} registered", created.id);
        Ok(created)
    }

    pub async fn get(&self, member_id: i32) -> AppResult<Member> {
        self.store
            .get_member(member_id)
            .await?
            .ok_or(AppError::MemberNotFound(member_id))
    }

    /// Block or reinstate a member. Takes the member row lock, so it waits
    /// for any checkout by this member in flight.
    pub async fn set_status(&self, member_id: i32, status: MemberStatus) -> AppResult<Member> {
        let mut tx = self.store.begin().await?;
        let mut member = tx
            .lock_member(member_id)
            .await?
            .ok_or(AppError::MemberNotFound(member_id))?;

        member.is_active = status == MemberStatus::Active;
        tx.set_member_active(member_id, member.is_active).await?;
        tx.commit().await?;

        tracing::info!("Member {} is now {:?}", member_id, status);
        Ok(member)
    }
}
