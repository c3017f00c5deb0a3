//! Tagged registry for polymorphic job behaviors.
//!
//! A behavior payload is `[u16 BE tag length][tag][serde_json fields]`. Only
//! types registered at process start can be encoded or decoded; an unknown
//! tag is always an error, never a fallback.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::types::RunInput;

/// The unit of work a job runs.
///
/// `TAG` names the type inside stored payloads and must stay stable across
/// releases. Fields are persisted with serde, so renaming a field breaks
/// existing rows the same way it would for any serde format.
///
/// `run` is fire-and-forget: it executes on the blocking pool, its outcome
/// is not observed, and a panic is contained by the engine.
pub trait Behavior: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TAG: &'static str;

    fn run(&self, input: &RunInput);
}

/// Object-safe form of [`Behavior`], implemented for every behavior.
pub trait DynBehavior: Send + Sync {
    fn tag(&self) -> &'static str;
    fn concrete_type(&self) -> TypeId;
    fn encode_fields(&self) -> serde_json::Result<Vec<u8>>;
    fn run(&self, input: &RunInput);
}

impl<B: Behavior> DynBehavior for B {
    fn tag(&self) -> &'static str {
        B::TAG
    }

    fn concrete_type(&self) -> TypeId {
        TypeId::of::<B>()
    }

    fn encode_fields(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    fn run(&self, input: &RunInput) {
        Behavior::run(self, input)
    }
}

type DecodeFn = fn(&[u8]) -> serde_json::Result<Arc<dyn DynBehavior>>;

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

fn decode_as<B: Behavior>(fields: &[u8]) -> serde_json::Result<Arc<dyn DynBehavior>> {
    let behavior: B = serde_json::from_slice(fields)?;
    Ok(Arc::new(behavior))
}

/// Maps stable tags to the concrete behavior types that may be persisted.
#[derive(Default)]
pub struct BehaviorRegistry {
    entries: HashMap<&'static str, Entry>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `B` under `B::TAG`. Registering the same type twice is a
    /// no-op; a different type under an existing tag is rejected.
    pub fn register<B: Behavior>(&mut self) -> Result<()> {
        let tag = B::TAG;
        if tag.is_empty() || tag.len() > usize::from(u16::MAX) {
            return Err(SchedulerError::Encoding(format!(
                "behavior tag for {} must be 1..=65535 bytes",
                type_name::<B>()
            )));
        }
        if let Some(existing) = self.entries.get(tag) {
            if existing.type_id == TypeId::of::<B>() {
                return Ok(());
            }
            return Err(SchedulerError::Encoding(format!(
                "behavior tag {tag:?} already registered by {}",
                existing.type_name
            )));
        }
        self.entries.insert(
            tag,
            Entry {
                type_id: TypeId::of::<B>(),
                type_name: type_name::<B>(),
                decode: decode_as::<B>,
            },
        );
        debug!(tag, type_name = type_name::<B>(), "behavior registered");
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<B: Behavior>(mut self) -> Result<Self> {
        self.register::<B>()?;
        Ok(self)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self, behavior: &dyn DynBehavior) -> Result<Vec<u8>> {
        let tag = behavior.tag();
        match self.entries.get(tag) {
            Some(entry) if entry.type_id == behavior.concrete_type() => {}
            Some(entry) => {
                return Err(SchedulerError::Encoding(format!(
                    "behavior tag {tag:?} is registered to {}, not this type",
                    entry.type_name
                )))
            }
            None => {
                return Err(SchedulerError::Encoding(format!(
                    "behavior tag {tag:?} is not registered"
                )))
            }
        }

        let fields = behavior
            .encode_fields()
            .map_err(|e| SchedulerError::Encoding(format!("behavior {tag:?}: {e}")))?;
        let mut out = Vec::with_capacity(2 + tag.len() + fields.len());
        // register() bounds tag length to u16.
        out.extend_from_slice(&(tag.len() as u16).to_be_bytes());
        out.extend_from_slice(tag.as_bytes());
        out.extend_from_slice(&fields);
        Ok(out)
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Arc<dyn DynBehavior>> {
        let (tag, fields) = split_payload(payload)?;
        let entry = self.entries.get(tag).ok_or_else(|| {
            SchedulerError::Decoding(format!("behavior tag {tag:?} is not registered"))
        })?;
        (entry.decode)(fields).map_err(|e| SchedulerError::Decoding(format!("behavior {tag:?}: {e}")))
    }
}

/// Read the tag of a behavior payload without decoding its fields.
pub fn payload_tag(payload: &[u8]) -> Result<&str> {
    split_payload(payload).map(|(tag, _)| tag)
}

fn split_payload(payload: &[u8]) -> Result<(&str, &[u8])> {
    let truncated = || SchedulerError::Decoding("behavior payload truncated".to_string());
    let len_bytes: [u8; 2] = payload
        .get(..2)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(truncated)?;
    let tag_len = usize::from(u16::from_be_bytes(len_bytes));
    let tag_bytes = payload.get(2..2 + tag_len).ok_or_else(truncated)?;
    let tag = std::str::from_utf8(tag_bytes)
        .map_err(|e| SchedulerError::Decoding(format!("behavior tag is not UTF-8: {e}")))?;
    Ok((tag, &payload[2 + tag_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        message: String,
    }

    impl Behavior for Echo {
        const TAG: &'static str = "echo";
        fn run(&self, _input: &RunInput) {}
    }

    #[derive(Serialize, Deserialize)]
    struct Impostor;

    impl Behavior for Impostor {
        const TAG: &'static str = "echo";
        fn run(&self, _input: &RunInput) {}
    }

    #[test]
    fn encode_decode_registered() {
        let registry = BehaviorRegistry::new().with::<Echo>().expect("register");
        let payload = registry
            .encode(&Echo { message: "hi".into() })
            .expect("encode");
        assert_eq!(payload_tag(&payload).expect("tag"), "echo");
        let decoded = registry.decode(&payload).expect("decode");
        assert_eq!(decoded.tag(), "echo");
        assert_eq!(decoded.concrete_type(), TypeId::of::<Echo>());
        assert_eq!(decoded.encode_fields().expect("fields"), br#"{"message":"hi"}"#);
    }

    #[test]
    fn encode_unregistered_fails() {
        let registry = BehaviorRegistry::new();
        let err = registry.encode(&Echo { message: "hi".into() }).unwrap_err();
        assert!(matches!(err, SchedulerError::Encoding(_)));
    }

    #[test]
    fn tag_collision_is_rejected() {
        let mut registry = BehaviorRegistry::new();
        registry.register::<Echo>().expect("register");
        registry.register::<Echo>().expect("same type is a no-op");
        assert!(registry.register::<Impostor>().is_err());
        assert_eq!(registry.len(), 1);

        // A value of the impostor type cannot borrow the echo tag either.
        assert!(matches!(
            registry.encode(&Impostor),
            Err(SchedulerError::Encoding(_))
        ));
    }

    #[test]
    fn decode_unknown_tag_fails() {
        let source = BehaviorRegistry::new().with::<Echo>().expect("register");
        let payload = source.encode(&Echo { message: "x".into() }).expect("encode");
        let empty = BehaviorRegistry::new();
        assert!(matches!(empty.decode(&payload), Err(SchedulerError::Decoding(_))));
    }

    #[test]
    fn decode_corrupt_payload_fails() {
        let registry = BehaviorRegistry::new().with::<Echo>().expect("register");
        let mut payload = registry.encode(&Echo { message: "x".into() }).expect("encode");
        payload.truncate(payload.len() - 3);
        assert!(matches!(registry.decode(&payload), Err(SchedulerError::Decoding(_))));
        assert!(matches!(registry.decode(&[0]), Err(SchedulerError::Decoding(_))));
        assert!(matches!(registry.decode(&[0, 9, b'e']), Err(SchedulerError::Decoding(_))));
    }
}
