//! Wire format of event-stream messages and the records this node consumes.

use serde::Deserialize;

use super::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// One message from the stream.  `did` is the author of the change.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub did: String,
    pub time_us: i64,
    pub kind: EventKind,
    #[serde(default)]
    pub commit: Option<Commit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub operation: Operation,
    pub collection: String,
    #[serde(default)]
    pub rkey: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

impl Commit {
    /// Decode the record body as `T`.
    pub fn record<T: serde::de::DeserializeOwned>(&self) -> Result<T, SyncError> {
        let record = self
            .record
            .clone()
            .ok_or_else(|| SyncError::Record(format!("{} commit has no record", self.collection)))?;
        serde_json::from_value(record)
            .map_err(|e| SyncError::Record(format!("bad {} record: {e}", self.collection)))
    }
}

/// `sh.tangled.publicKey`
#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyRecord {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub created: Option<String>,
}

/// `sh.tangled.knot.member`
#[derive(Debug, Clone, Deserialize)]
pub struct KnotMemberRecord {
    pub member: String,
    pub domain: String,
    #[serde(rename = "addedAt", default)]
    pub added_at: Option<String>,
}

pub fn decode(raw: &str) -> Result<Event, SyncError> {
    serde_json::from_str(raw).map_err(|e| SyncError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::{KNOT_MEMBER_NSID, PUBLIC_KEY_NSID};

    #[test]
    fn decodes_public_key_commit() {
        let raw = r#"{
            "did": "did:plc:abc",
            "time_us": 1725911162329308,
            "kind": "commit",
            "commit": {
                "rev": "3l3qo2vutsw2b",
                "operation": "create",
                "collection": "sh.tangled.publicKey",
                "rkey": "3l3qo2vuowo2b",
                "record": {
                    "$type": "sh.tangled.publicKey",
                    "key": "ssh-ed25519 AAAA",
                    "name": "laptop",
                    "created": "2024-09-09T19:46:02Z"
                },
                "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
            }
        }"#;
        let event = decode(raw).unwrap();
        assert_eq!(event.kind, EventKind::Commit);
        assert_eq!(event.time_us, 1725911162329308);
        let commit = event.commit.unwrap();
        assert_eq!(commit.collection, PUBLIC_KEY_NSID);
        assert_eq!(commit.operation, Operation::Create);
        let record: PublicKeyRecord = commit.record().unwrap();
        assert_eq!(record.name, "laptop");
        assert_eq!(record.created.as_deref(), Some("2024-09-09T19:46:02Z"));
    }

    #[test]
    fn decodes_member_record() {
        let raw = r#"{"did":"did:plc:owner","time_us":5,"kind":"commit","commit":{
            "operation":"create","collection":"sh.tangled.knot.member","rkey":"x",
            "record":{"member":"did:plc:new","domain":"knot.example.com","addedAt":"2024-09-09T19:46:02Z"}}}"#;
        let commit = decode(raw).unwrap().commit.unwrap();
        assert_eq!(commit.collection, KNOT_MEMBER_NSID);
        let record: KnotMemberRecord = commit.record().unwrap();
        assert_eq!(record.member, "did:plc:new");
        assert_eq!(record.domain, "knot.example.com");
    }

    #[test]
    fn unknown_kinds_and_operations_decode() {
        let event = decode(r#"{"did":"did:plc:a","time_us":1,"kind":"labels"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
        assert!(event.commit.is_none());

        let raw = r#"{"did":"d","time_us":1,"kind":"commit","commit":{"operation":"upsert","collection":"c"}}"#;
        assert_eq!(decode(raw).unwrap().commit.unwrap().operation, Operation::Unknown);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(decode("{not json"), Err(SyncError::Decode(_))));
        assert!(matches!(decode(r#"{"did":"d"}"#), Err(SyncError::Decode(_))));
    }

    #[test]
    fn missing_record_is_a_record_error() {
        let raw = r#"{"did":"d","time_us":1,"kind":"commit","commit":{"operation":"delete","collection":"sh.tangled.publicKey"}}"#;
        let commit = decode(raw).unwrap().commit.unwrap();
        assert!(matches!(commit.record::<PublicKeyRecord>(), Err(SyncError::Record(_))));
    }
}
