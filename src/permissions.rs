use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::{GroupId, UserId};
use crate::store::DocFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

/// Caller identity. Must come from validated auth/session state, never from request bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: UserId,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub role: Role,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            group_ids: Vec::new(),
            role: Role::User,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            group_ids: Vec::new(),
            role: Role::Admin,
        }
    }

    pub fn with_groups(mut self, group_ids: Vec<GroupId>) -> Self {
        self.group_ids = group_ids;
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Produces the store filter fragment restricting what an actor may see.
pub trait PermissionPolicy: Send + Sync {
    fn read_filter(&self, actor: &Actor) -> DocFilter;

    fn write_filter(&self, actor: &Actor) -> DocFilter {
        self.read_filter(actor)
    }
}

/// Documents are visible to their creators, to members of an owning group, and to admins.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreatorGroupPolicy;

impl PermissionPolicy for CreatorGroupPolicy {
    fn read_filter(&self, actor: &Actor) -> DocFilter {
        if actor.is_admin() {
            return DocFilter::All;
        }

        let mut visible = vec![DocFilter::array_contains(
            "creator_ids",
            json!(actor.user_id),
        )];
        visible.extend(
            actor
                .group_ids
                .iter()
                .map(|group_id| DocFilter::array_contains("group_ids", json!(group_id))),
        );
        DocFilter::Or(visible)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn creators_and_group_members_can_read() {
        let owner = UserId(Uuid::new_v4());
        let group = GroupId(Uuid::new_v4());
        let document = json!({
            "item_id": "s1",
            "creator_ids": [owner],
            "group_ids": [group]
        });

        let policy = CreatorGroupPolicy;
        assert!(policy.read_filter(&Actor::user(owner)).matches(&document));

        let member = Actor::user(UserId(Uuid::new_v4())).with_groups(vec![group]);
        assert!(policy.read_filter(&member).matches(&document));

        let stranger = Actor::user(UserId(Uuid::new_v4()));
        assert!(!policy.read_filter(&stranger).matches(&document));
    }

    #[test]
    fn admins_are_unrestricted() {
        let admin = Actor::admin(UserId(Uuid::new_v4()));
        assert_eq!(CreatorGroupPolicy.read_filter(&admin), DocFilter::All);
    }
}
