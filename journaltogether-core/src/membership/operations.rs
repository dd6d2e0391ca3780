//! Group operations
//!
//! Each mutation is a single store transaction. The reconciler's feeds pick
//! up the result; nothing here touches the snapshot directly.

use super::errors::{MembershipError, MembershipResult};
use super::reconciler::MembershipReconciler;
use crate::model::types::{GroupId, InvitationId, UserId};
use crate::metrics::Timer;
use crate::model::validation::{validate_email, validate_group_name};
use crate::model::{Group, Identity, Invitation};
use crate::remote::{path, StoreResult, Transaction};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

impl MembershipReconciler {
    /// Create a group with the caller as its sole member
    pub async fn create_group(&self, name: &str) -> MembershipResult<GroupId> {
        let name = validate_group_name(name)?;
        let identity = self.require_identity()?;

        let group_id = GroupId::generate();
        let group = Group::new(group_id.clone(), name, &identity.id, &identity.email);

        let transaction = Transaction::new()
            .set(path::group(&group_id)?, serde_json::to_value(&group)?)
            .set(
                path::user_group_entry(&identity.id, &group_id)?,
                Value::Bool(true),
            );
        self.commit(transaction).await?;

        info!(group = %group_id, user = %identity.id, "Group created");
        Ok(group_id)
    }

    /// Remove the group document and every member's index entry
    pub async fn delete_group(&self, group_id: &GroupId) -> MembershipResult<()> {
        let identity = self.require_identity()?;
        let (group, members) = self.member_view(&identity, group_id).await?;

        // A member added after the read would keep a dangling index entry.
        let mut transaction = Transaction::new()
            .require(path::group_members(group_id)?, members)
            .remove(path::group(group_id)?);
        for member in group.members.keys() {
            transaction = transaction.remove(path::user_group_entry(member, group_id)?);
        }
        self.commit(transaction).await?;

        info!(group = %group_id, members = group.member_count(), "Group deleted");
        Ok(())
    }

    /// Remove one member from a group along with their index entry
    pub async fn remove_member(&self, group_id: &GroupId, user_id: &UserId) -> MembershipResult<()> {
        let identity = self.require_identity()?;
        let (group, members) = self.member_view(&identity, group_id).await?;

        if !group.is_member(user_id) {
            return Err(MembershipError::MemberNotFound {
                group: group_id.clone(),
                member: user_id.clone(),
            });
        }
        if group.member_count() <= 1 {
            return Err(MembershipError::LastMember(group_id.clone()));
        }

        // Two concurrent removals must not both pass the last-member check.
        let transaction = Transaction::new()
            .require(path::group_members(group_id)?, members)
            .remove(path::group_member(group_id, user_id)?)
            .remove(path::user_group_entry(user_id, group_id)?);
        self.commit(transaction).await?;

        info!(group = %group_id, member = %user_id, "Member removed");
        Ok(())
    }

    /// Record an invitation, then ask the application server to deliver it
    ///
    /// The invitee is not added to the group. A delivery failure leaves the
    /// record in place and is reported with its id.
    pub async fn invite_member(
        &self,
        group_id: &GroupId,
        email: &str,
    ) -> MembershipResult<InvitationId> {
        let email = validate_email(email)?;
        let identity = self.require_identity()?;
        let (group, _) = self.member_view(&identity, group_id).await?;

        let invitation = Invitation::new(group_id.clone(), group.name, email, identity.id.clone());
        let transaction = Transaction::new().set(
            path::invitation(&invitation.id)?,
            serde_json::to_value(&invitation)?,
        );
        self.commit(transaction).await?;

        let delivery = self
            .app
            .deliver_invitation(&identity.session_token, &invitation);
        let reason = match with_deadline(self.config.invite_delivery_timeout, delivery).await {
            Some(Ok(())) => {
                info!(invitation = %invitation.id, group = %group_id, "Invitation delivered");
                return Ok(invitation.id);
            }
            Some(Err(e)) => e.to_string(),
            None => "delivery timed out".to_string(),
        };

        warn!(invitation = %invitation.id, reason = %reason, "Invitation delivery failed");
        Err(MembershipError::InviteDeliveryFailed {
            invitation_id: invitation.id,
            reason,
        })
    }

    /// Read a group the caller belongs to, along with its raw `members`
    /// object for use as a write precondition
    async fn member_view(
        &self,
        identity: &Identity,
        group_id: &GroupId,
    ) -> MembershipResult<(Group, Option<Value>)> {
        let document_path = path::group(group_id)?;
        let document = self
            .with_store_deadline(self.store.read(&document_path))
            .await?
            .ok_or_else(|| MembershipError::GroupNotFound(group_id.clone()))?;

        let members = document.get("members").cloned();
        let mut group: Group = serde_json::from_value(with_id(document, group_id))?;
        group.id = group_id.clone();

        if !group.is_member(&identity.id) {
            return Err(MembershipError::PermissionDenied(format!(
                "{} is not a member of {}",
                identity.id, group_id
            )));
        }
        Ok((group, members))
    }

    async fn commit(&self, transaction: Transaction) -> MembershipResult<()> {
        let timer = Timer::new("membership.operation.duration_ms");
        let result = self
            .with_store_deadline(self.store.transact(transaction))
            .await;
        timer.stop();
        result
    }

    async fn with_store_deadline<T>(
        &self,
        operation: impl Future<Output = StoreResult<T>>,
    ) -> MembershipResult<T> {
        match with_deadline(self.config.operation_timeout, operation).await {
            Some(result) => Ok(result?),
            None => Err(MembershipError::Network(format!(
                "store did not answer within {:?}",
                self.config.operation_timeout
            ))),
        }
    }
}

async fn with_deadline<T>(limit: Duration, operation: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, operation).await.ok()
}

/// Group documents written by older clients may lack the `id` field
fn with_id(mut document: Value, group_id: &GroupId) -> Value {
    if let Value::Object(fields) = &mut document {
        fields
            .entry("id")
            .or_insert_with(|| Value::String(group_id.to_string()));
    }
    document
}
