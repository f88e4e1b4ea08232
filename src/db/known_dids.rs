//! The set of identities this node tracks on the event stream.

use super::{Db, StoreError};

/// `did:<method>:<id>` with nothing that could escape a URL path segment or
/// an `authorized_keys` option.
pub fn is_valid_did(did: &str) -> bool {
    did.strip_prefix("did:").is_some_and(|rest| {
        !rest.is_empty()
            && !rest.chars().any(|c| {
                c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#' | '"' | '\\')
            })
    })
}

pub fn check_did(did: &str) -> Result<(), StoreError> {
    if is_valid_did(did) {
        Ok(())
    } else {
        Err(StoreError::InvalidDid(did.to_string()))
    }
}

impl Db {
    /// Returns `true` if the DID was not known before.
    pub fn add_did(&self, did: &str) -> Result<bool, StoreError> {
        check_did(did)?;
        let inserted = self.with_conn(|conn| {
            conn.execute("INSERT OR IGNORE INTO known_dids (did) VALUES (?1)", [did])
        })?;
        Ok(inserted > 0)
    }

    pub fn known_dids(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT did FROM known_dids ORDER BY did")?;
            let dids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(dids)
        })
    }

    pub fn has_known_dids(&self) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT EXISTS (SELECT 1 FROM known_dids)", [], |row| {
                row.get::<_, bool>(0)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_did_deduplicates() {
        let db = Db::in_memory().unwrap();
        assert!(!db.has_known_dids().unwrap());
        assert!(db.add_did("did:plc:b").unwrap());
        assert!(db.add_did("did:plc:a").unwrap());
        assert!(!db.add_did("did:plc:a").unwrap());
        assert!(db.has_known_dids().unwrap());
        assert_eq!(db.known_dids().unwrap(), vec!["did:plc:a", "did:plc:b"]);
    }

    #[test]
    fn did_shape() {
        assert!(is_valid_did("did:plc:qfpnj4og54vl56wngdriaxug"));
        assert!(is_valid_did("did:web:knot.example.com"));
        for bad in [
            "",
            "did:",
            "plc:abc",
            "did:plc:a b",
            "did:plc:a\nb",
            "did:plc:../../etc",
            "did:plc:a?x=1",
            "did:plc:a#frag",
            "did:plc:a\"b",
        ] {
            assert!(!is_valid_did(bad), "{bad:?}");
        }
    }

    #[test]
    fn add_did_refuses_non_dids() {
        let db = Db::in_memory().unwrap();
        assert!(matches!(
            db.add_did("did:plc:a b"),
            Err(StoreError::InvalidDid(_))
        ));
        assert!(db.known_dids().unwrap().is_empty());
    }
}
