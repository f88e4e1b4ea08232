//! SQLite-backed [`PolicyBackend`].

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::{debug, instrument};

use super::glob::glob_match;
use super::{Policy, PolicyBackend, MAX_ROLE_DEPTH};
use crate::db::{Db, StoreError};

const ROLES_OF_SUBJECT: &str = "SELECT role FROM groupings WHERE subject = ?1 AND domain = ?2";
const SUBJECTS_OF_ROLE: &str = "SELECT subject FROM groupings WHERE role = ?1 AND domain = ?2";

/// Policy tuples stored in the node database.
#[derive(Clone)]
pub struct SqlitePolicyStore {
    db: Db,
}

impl SqlitePolicyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn ensure_domain(domain: &str) -> Result<(), StoreError> {
    if domain.is_empty() {
        return Err(StoreError::EmptyDomain);
    }
    Ok(())
}

/// Breadth-first walk of the grouping graph from `start` using `edge_sql`.
/// Bounded by [`MAX_ROLE_DEPTH`]; already visited nodes are not revisited.
fn walk_groupings(
    conn: &Connection,
    start: &str,
    domain: &str,
    edge_sql: &str,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(edge_sql)?;
    let mut seen: HashSet<String> = HashSet::from([start.to_string()]);
    let mut found = Vec::new();
    let mut frontier = vec![start.to_string()];

    for _ in 0..MAX_ROLE_DEPTH {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for node in &frontier {
            let edges = stmt.query_map(params![node, domain], |row| row.get::<_, String>(0))?;
            for edge in edges {
                let edge = edge?;
                if seen.insert(edge.clone()) {
                    found.push(edge.clone());
                    next.push(edge);
                }
            }
        }
        frontier = next;
    }

    if !frontier.is_empty() {
        debug!(%start, %domain, "grouping walk stopped at depth limit");
    }
    Ok(found)
}

impl PolicyBackend for SqlitePolicyStore {
    #[instrument(skip(self), level = "debug")]
    fn enforce(
        &self,
        subject: &str,
        domain: &str,
        object: &str,
        action: &str,
    ) -> Result<bool, StoreError> {
        ensure_domain(domain)?;
        self.db.with_conn(|conn| {
            let mut subjects = vec![subject.to_string()];
            subjects.extend(walk_groupings(conn, subject, domain, ROLES_OF_SUBJECT)?);

            let mut stmt = conn.prepare_cached(
                "SELECT object FROM grants WHERE subject = ?1 AND domain = ?2 AND action = ?3",
            )?;
            for s in &subjects {
                let patterns =
                    stmt.query_map(params![s, domain, action], |row| row.get::<_, String>(0))?;
                for pattern in patterns {
                    if glob_match(&pattern?, object) {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        })
    }

    fn add_policies(&self, policies: &[Policy]) -> Result<usize, StoreError> {
        for policy in policies {
            ensure_domain(&policy.domain)?;
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut added = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO grants (subject, domain, object, action)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for p in policies {
                    added += stmt.execute(params![p.subject, p.domain, p.object, p.action])?;
                }
            }
            tx.commit()?;
            Ok(added)
        })
    }

    fn remove_policy(&self, policy: &Policy) -> Result<bool, StoreError> {
        ensure_domain(&policy.domain)?;
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM grants
                 WHERE subject = ?1 AND domain = ?2 AND object = ?3 AND action = ?4",
                params![policy.subject, policy.domain, policy.object, policy.action],
            )
        })?;
        Ok(removed > 0)
    }

    fn remove_object(&self, domain: &str, object: &str) -> Result<usize, StoreError> {
        ensure_domain(domain)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM grants WHERE domain = ?1 AND object = ?2",
                params![domain, object],
            )
        })
    }

    fn add_grouping(&self, subject: &str, role: &str, domain: &str) -> Result<bool, StoreError> {
        ensure_domain(domain)?;
        let added = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO groupings (subject, role, domain) VALUES (?1, ?2, ?3)",
                params![subject, role, domain],
            )
        })?;
        Ok(added > 0)
    }

    fn remove_grouping(
        &self,
        subject: &str,
        role: &str,
        domain: &str,
    ) -> Result<bool, StoreError> {
        ensure_domain(domain)?;
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM groupings WHERE subject = ?1 AND role = ?2 AND domain = ?3",
                params![subject, role, domain],
            )
        })?;
        Ok(removed > 0)
    }

    fn has_grouping(&self, subject: &str, role: &str, domain: &str) -> Result<bool, StoreError> {
        ensure_domain(domain)?;
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM groupings
                                WHERE subject = ?1 AND role = ?2 AND domain = ?3)",
                params![subject, role, domain],
                |row| row.get::<_, bool>(0),
            )
        })
    }

    fn users_for_role(&self, role: &str, domain: &str) -> Result<Vec<String>, StoreError> {
        ensure_domain(domain)?;
        self.db
            .with_conn(|conn| walk_groupings(conn, role, domain, SUBJECTS_OF_ROLE))
    }

    fn roles_for_user(&self, subject: &str, domain: &str) -> Result<Vec<String>, StoreError> {
        ensure_domain(domain)?;
        self.db
            .with_conn(|conn| walk_groupings(conn, subject, domain, ROLES_OF_SUBJECT))
    }

    fn domains_for_user(&self, subject: &str) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT domain FROM groupings WHERE subject = ?1 ORDER BY domain",
            )?;
            let domains = stmt
                .query_map([subject], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(domains)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqlitePolicyStore {
        SqlitePolicyStore::new(Db::in_memory().unwrap())
    }

    #[test]
    fn grants_are_inherited_transitively() {
        let store = store();
        store
            .add_policies(&[Policy::new("role:c", "knot", "thing", "act")])
            .unwrap();
        store.add_grouping("did:plc:a", "role:b", "knot").unwrap();
        store.add_grouping("role:b", "role:c", "knot").unwrap();

        assert!(store.enforce("did:plc:a", "knot", "thing", "act").unwrap());
        assert_eq!(
            store.roles_for_user("did:plc:a", "knot").unwrap(),
            vec!["role:b", "role:c"]
        );
        assert_eq!(
            store.users_for_role("role:c", "knot").unwrap(),
            vec!["role:b", "did:plc:a"]
        );
    }

    #[test]
    fn cyclic_groupings_terminate() {
        let store = store();
        store.add_grouping("role:a", "role:b", "knot").unwrap();
        store.add_grouping("role:b", "role:a", "knot").unwrap();

        assert!(!store.enforce("role:a", "knot", "x", "y").unwrap());
        assert_eq!(store.roles_for_user("role:a", "knot").unwrap(), vec!["role:b"]);
    }

    #[test]
    fn resolution_stops_at_depth_limit() {
        let store = store();
        // Chain of MAX_ROLE_DEPTH + 1 hops; only the last role holds the grant.
        for i in 0..=MAX_ROLE_DEPTH {
            store
                .add_grouping(&format!("r{i}"), &format!("r{}", i + 1), "knot")
                .unwrap();
        }
        let last = format!("r{}", MAX_ROLE_DEPTH + 1);
        store
            .add_policies(&[Policy::new(&last, "knot", "obj", "act")])
            .unwrap();

        assert!(!store.enforce("r0", "knot", "obj", "act").unwrap());
        assert!(store.enforce("r1", "knot", "obj", "act").unwrap());
    }

    #[test]
    fn domains_are_isolated() {
        let store = store();
        store
            .add_policies(&[Policy::new("did:plc:a", "one.example", "did:plc:a/*", "repo:push")])
            .unwrap();
        store.add_grouping("did:plc:b", "did:plc:a", "two.example").unwrap();

        assert!(store
            .enforce("did:plc:a", "one.example", "did:plc:a/r", "repo:push")
            .unwrap());
        assert!(!store
            .enforce("did:plc:a", "two.example", "did:plc:a/r", "repo:push")
            .unwrap());
        assert!(!store
            .enforce("did:plc:b", "two.example", "did:plc:a/r", "repo:push")
            .unwrap());
        assert_eq!(
            store.domains_for_user("did:plc:b").unwrap(),
            vec!["two.example"]
        );
    }

    #[test]
    fn empty_domain_is_an_error() {
        let store = store();
        assert!(matches!(
            store.enforce("a", "", "b", "c"),
            Err(StoreError::EmptyDomain)
        ));
        assert!(matches!(
            store.add_policies(&[Policy::new("a", "", "b", "c")]),
            Err(StoreError::EmptyDomain)
        ));
    }

    #[test]
    fn remove_object_cascades_within_domain() {
        let store = store();
        store
            .add_policies(&[
                Policy::new("did:plc:a", "knot", "did:plc:a/r", "repo:push"),
                Policy::new("did:plc:b", "knot", "did:plc:a/r", "repo:settings"),
                Policy::new("did:plc:a", "other", "did:plc:a/r", "repo:push"),
            ])
            .unwrap();

        assert_eq!(store.remove_object("knot", "did:plc:a/r").unwrap(), 2);
        assert!(store
            .enforce("did:plc:a", "other", "did:plc:a/r", "repo:push")
            .unwrap());
    }
}
