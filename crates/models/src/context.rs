//! Request-scoped ambient state: the caller's identity attributes and a
//! per-request memo of access decisions.
//!
//! One request pins one model snapshot and one identity for its whole
//! lifetime. The decision cache therefore never outlives a request and
//! must not be shared across requests with different identities.

use crate::acl::Right;
use crate::rights::Resource;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

/// The wildcard role every caller implicitly holds.
pub const WILDCARD_ROLE: &str = "*";

/// The caller's identity attributes: a set of group or role
/// identifiers. The wildcard role is always implicitly a member.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    roles: BTreeSet<String>,
}

impl Identity {
    pub fn new<I, S>(roles: I) -> Identity
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Identity {
            roles: roles
                .into_iter()
                .map(Into::into)
                .filter(|r| r != WILDCARD_ROLE)
                .collect(),
        }
    }

    /// An identity with no attributes beyond the implicit wildcard.
    pub fn anonymous() -> Identity {
        Identity::default()
    }

    /// Explicit roles, without the implicit wildcard.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    /// Roles in the order SQL role-set literals are rendered: explicit
    /// roles sorted, then the wildcard.
    pub fn roles_with_wildcard(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.roles.iter().map(String::as_str).collect();
        out.push(WILDCARD_ROLE);
        out
    }

    /// Does the identity hold any member of `acl`, counting the
    /// wildcard?
    pub fn holds_any(&self, acl: &[String]) -> bool {
        acl.iter()
            .any(|m| m == WILDCARD_ROLE || self.roles.contains(m))
    }
}

/// Per-request evaluation context handed to every model operation that
/// makes or enforces access decisions.
#[derive(Debug)]
pub struct RequestContext {
    pub identity: Identity,
    decisions: RefCell<HashMap<(Resource, Right), Option<bool>>>,
}

impl RequestContext {
    pub fn new(identity: Identity) -> RequestContext {
        RequestContext {
            identity,
            decisions: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn cached(&self, resource: Resource, right: Right) -> Option<Option<bool>> {
        self.decisions.borrow().get(&(resource, right)).copied()
    }

    pub(crate) fn remember(&self, resource: Resource, right: Right, decision: Option<bool>) {
        self.decisions.borrow_mut().insert((resource, right), decision);
    }

    /// Drop memoized decisions. Mutations that change ACLs mid-request
    /// call this so later checks observe the new policy.
    pub fn invalidate(&self) {
        self.decisions.borrow_mut().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wildcard_is_implicit() {
        let id = Identity::new(["grp1", "*"]);
        assert_eq!(id.roles().collect::<Vec<_>>(), vec!["grp1"]);
        assert_eq!(id.roles_with_wildcard(), vec!["grp1", "*"]);
        assert!(id.holds_any(&["*".to_string()]));
        assert!(id.holds_any(&["grp1".to_string()]));
        assert!(!id.holds_any(&["grp2".to_string()]));

        let anon = Identity::anonymous();
        assert_eq!(anon.roles_with_wildcard(), vec!["*"]);
        assert!(anon.holds_any(&["*".to_string()]));
        assert!(!anon.holds_any(&["grp1".to_string()]));
    }
}
