//! Roles and the explicit authorization inputs of the workflow.
//!
//! The engine never looks up who the caller is. An external authorization
//! collaborator resolves identity and roles, and hands them in as an [`Actor`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ActorId;

/// A role an actor may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates reservation requests.
    Maker,
    /// Checks a request before it is authorized.
    Verifier,
    /// Gives final approval.
    Authorizer,
    /// Hands equipment over and takes it back.
    Custodian,
    /// Unrestricted back-office role.
    Administrator,
}

/// A resolved caller: identity plus the roles it holds for this request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Who is acting.
    pub id: ActorId,
    /// Roles held for the duration of this request.
    pub roles: BTreeSet<Role>,
}

impl Actor {
    /// Creates an actor holding the given roles.
    pub fn new(id: ActorId, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            id,
            roles: roles.into_iter().collect(),
        }
    }

    /// Whether the actor holds at least one of `allowed`.
    pub fn holds_any(&self, allowed: &BTreeSet<Role>) -> bool {
        self.roles.iter().any(|role| allowed.contains(role))
    }
}

/// An action on a batch that is gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardedAction {
    /// Creation through the streamlined (fast-track) path.
    StreamlinedCreate,
    /// PendingVerification -> PendingApproval.
    Verify,
    /// PendingApproval -> Approved.
    Approve,
    /// Approved -> Released.
    Release,
    /// Released -> PartiallyReturned/Returned.
    Return,
    /// Pre-release -> Canceled.
    Cancel,
    /// Move a borrowed line's return date later.
    ExtendReturnDate,
}

impl fmt::Display for GuardedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StreamlinedCreate => "fast-track",
            Self::Verify => "verify",
            Self::Approve => "approve",
            Self::Release => "release",
            Self::Return => "return",
            Self::Cancel => "cancel",
            Self::ExtendReturnDate => "extend",
        };
        f.write_str(name)
    }
}

fn roles<const N: usize>(list: [Role; N]) -> BTreeSet<Role> {
    list.into_iter().collect()
}

fn default_streamlined() -> BTreeSet<Role> {
    roles([Role::Authorizer, Role::Administrator])
}

fn default_verify() -> BTreeSet<Role> {
    roles([Role::Verifier, Role::Administrator])
}

fn default_approve() -> BTreeSet<Role> {
    roles([Role::Authorizer, Role::Administrator])
}

fn default_custody() -> BTreeSet<Role> {
    roles([Role::Custodian, Role::Administrator])
}

fn default_cancel() -> BTreeSet<Role> {
    roles([Role::Verifier, Role::Authorizer, Role::Administrator])
}

fn default_extend() -> BTreeSet<Role> {
    roles([Role::Custodian, Role::Authorizer, Role::Administrator])
}

/// Which roles may perform each guarded action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePolicy {
    /// Roles whose non-critical requests skip straight to `Approved`.
    pub streamlined: BTreeSet<Role>,
    /// Roles allowed to verify.
    pub verify: BTreeSet<Role>,
    /// Roles allowed to approve.
    pub approve: BTreeSet<Role>,
    /// Roles allowed to record the physical hand-over.
    pub release: BTreeSet<Role>,
    /// Roles allowed to record returns.
    pub receive_return: BTreeSet<Role>,
    /// Roles allowed to cancel a batch they did not create.
    pub cancel: BTreeSet<Role>,
    /// Roles allowed to extend return dates.
    pub extend: BTreeSet<Role>,
}

impl Default for RolePolicy {
    fn default() -> Self {
        Self {
            streamlined: default_streamlined(),
            verify: default_verify(),
            approve: default_approve(),
            release: default_custody(),
            receive_return: default_custody(),
            cancel: default_cancel(),
            extend: default_extend(),
        }
    }
}

impl RolePolicy {
    /// Roles permitted for `action`.
    pub const fn allowed(&self, action: GuardedAction) -> &BTreeSet<Role> {
        match action {
            GuardedAction::StreamlinedCreate => &self.streamlined,
            GuardedAction::Verify => &self.verify,
            GuardedAction::Approve => &self.approve,
            GuardedAction::Release => &self.release,
            GuardedAction::Return => &self.receive_return,
            GuardedAction::Cancel => &self.cancel,
            GuardedAction::ExtendReturnDate => &self.extend,
        }
    }

    /// Whether `actor` may perform `action`.
    pub fn permits(&self, actor: &Actor, action: GuardedAction) -> bool {
        actor.holds_any(self.allowed(action))
    }
}
