//! Notification payloads.
//!
//! Three payloads travel on the channel:
//! - the empty string wakes listeners up (used to stop them),
//! - `refresh pool <process id>` asks peers to reload their class registry,
//! - a compact JSON array of cache names invalidates those caches.

use thiserror::Error;

const REFRESH_POOL: &str = "refresh pool";

/// A decoded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Wake,
    RefreshPool { process_id: Option<String> },
    Invalidate(Vec<String>),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed cache notification {payload:?}: {reason}")]
    Malformed { payload: String, reason: String },
}

impl Payload {
    /// Decode a raw payload.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::Wake);
        }
        if let Some(rest) = trimmed.strip_prefix(REFRESH_POOL) {
            let process_id = rest.trim();
            return Ok(Self::RefreshPool {
                process_id: (!process_id.is_empty()).then(|| process_id.to_string()),
            });
        }
        serde_json::from_str::<Vec<String>>(trimmed)
            .map(Self::Invalidate)
            .map_err(|e| PayloadError::Malformed {
                payload: raw.to_string(),
                reason: e.to_string(),
            })
    }

    /// Encode for publishing.
    pub fn encode(&self) -> String {
        match self {
            Self::Wake => String::new(),
            Self::RefreshPool { process_id: Some(id) } => format!("{} {}", REFRESH_POOL, id),
            Self::RefreshPool { process_id: None } => REFRESH_POOL.to_string(),
            Self::Invalidate(names) => {
                serde_json::to_string(names).unwrap_or_else(|_| String::from("[]"))
            }
        }
    }
}

/// Split invalidated names into payloads of at most `batch_size` names.
pub fn invalidation_batches(names: &[String], batch_size: usize) -> Vec<String> {
    names
        .chunks(batch_size.max(1))
        .map(|chunk| Payload::Invalidate(chunk.to_vec()).encode())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wake() {
        assert_eq!(Payload::parse(""), Ok(Payload::Wake));
        assert_eq!(Payload::parse("  "), Ok(Payload::Wake));
    }

    #[test]
    fn test_parse_refresh_pool() {
        assert_eq!(
            Payload::parse("refresh pool 0190-abc"),
            Ok(Payload::RefreshPool {
                process_id: Some("0190-abc".to_string())
            })
        );
        assert_eq!(
            Payload::parse("refresh pool"),
            Ok(Payload::RefreshPool { process_id: None })
        );
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(
            Payload::parse(r#"["ir.rule","ir.model.access"]"#),
            Ok(Payload::Invalidate(vec![
                "ir.rule".to_string(),
                "ir.model.access".to_string()
            ]))
        );
    }

    #[test]
    fn test_parse_garbage() {
        let err = Payload::parse("{\"not\": \"a list\"}").unwrap_err();
        assert!(err.to_string().contains("Malformed cache notification"));
        assert!(Payload::parse("[1, 2]").is_err());
    }

    #[test]
    fn test_encode_is_compact() {
        let payload = Payload::Invalidate(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(payload.encode(), r#"["a","b"]"#);
        assert_eq!(Payload::Wake.encode(), "");
        assert_eq!(
            Payload::RefreshPool {
                process_id: Some("p1".to_string())
            }
            .encode(),
            "refresh pool p1"
        );
    }

    #[test]
    fn test_batches_respect_size() {
        let names: Vec<String> = (0..300).map(|i| format!("cache.{}", i)).collect();
        let batches = invalidation_batches(&names, 125);
        assert_eq!(batches.len(), 3);

        let decoded: Vec<String> = batches
            .iter()
            .flat_map(|raw| match Payload::parse(raw) {
                Ok(Payload::Invalidate(names)) => names,
                other => panic!("unexpected payload: {:?}", other),
            })
            .collect();
        assert_eq!(decoded, names);
    }

    #[test]
    fn test_no_names_no_batches() {
        assert!(invalidation_batches(&[], 125).is_empty());
    }
}
