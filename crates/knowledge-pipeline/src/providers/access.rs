//! Permission collaborator consulted before mutating operations

use crate::error::{Error, Result};
use crate::types::{Actor, FileRecord, Repository};

/// Decides whether an actor may touch a repository or file
pub trait AccessPolicy: Send + Sync {
    fn check_repository(&self, actor: &Actor, repo: &Repository) -> Result<()>;

    fn check_file(&self, actor: &Actor, file: &FileRecord) -> Result<()>;
}

/// Owners, members of the owning space, and system actors are allowed
pub struct OwnerAccessPolicy;

impl OwnerAccessPolicy {
    fn allowed(actor: &Actor, owner_uid: &str, space_id: Option<i64>) -> bool {
        if actor.system || actor.user_id == owner_uid {
            return true;
        }
        matches!((actor.space_id, space_id), (Some(a), Some(b)) if a == b)
    }
}

impl AccessPolicy for OwnerAccessPolicy {
    fn check_repository(&self, actor: &Actor, repo: &Repository) -> Result<()> {
        if Self::allowed(actor, &repo.owner_uid, repo.space_id) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "user {} cannot access repository {}",
                actor.user_id, repo.id
            )))
        }
    }

    fn check_file(&self, actor: &Actor, file: &FileRecord) -> Result<()> {
        if Self::allowed(actor, &file.owner_uid, file.space_id) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "user {} cannot access file {}",
                actor.user_id, file.id
            )))
        }
    }
}

/// Allows everything; for single-user deployments
pub struct AllowAllPolicy;

impl AccessPolicy for AllowAllPolicy {
    fn check_repository(&self, _actor: &Actor, _repo: &Repository) -> Result<()> {
        Ok(())
    }

    fn check_file(&self, _actor: &Actor, _file: &FileRecord) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn repo(owner: &str, space: Option<i64>) -> Repository {
        Repository {
            id: 1,
            name: "r".to_string(),
            owner_uid: owner.to_string(),
            space_id: space,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_owner_and_space_members_allowed() {
        let policy = OwnerAccessPolicy;
        assert!(policy.check_repository(&Actor::user("alice", None), &repo("alice", None)).is_ok());
        assert!(policy
            .check_repository(&Actor::user("bob", Some(7)), &repo("alice", Some(7)))
            .is_ok());
        assert!(matches!(
            policy.check_repository(&Actor::user("bob", None), &repo("alice", Some(7))),
            Err(Error::PermissionDenied(_))
        ));
        assert!(policy.check_repository(&Actor::system(), &repo("alice", None)).is_ok());
    }
}
