//! Nodes Configuration Codec
//!
//! The configuration travels to and from the versioned store as an
//! opaque blob. The encoding is JSON behind a tiny versioned envelope,
//! so old readers can reject blobs from a future codec instead of
//! misparsing them. `serialize` then `deserialize` is the identity on
//! every valid configuration.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{MembershipError, Result};
use crate::nodes_config::NodesConfiguration;

const CODEC_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    codec_version: u32,
    config: NodesConfiguration,
}

pub fn serialize(config: &NodesConfiguration) -> Result<Bytes> {
    let envelope = Envelope {
        codec_version: CODEC_VERSION,
        config: config.clone(),
    };
    let bytes = serde_json::to_vec(&envelope)
        .map_err(|e| MembershipError::Codec(format!("serialize: {}", e)))?;
    Ok(Bytes::from(bytes))
}

pub fn deserialize(bytes: &[u8]) -> Result<NodesConfiguration> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| MembershipError::Codec(format!("deserialize: {}", e)))?;
    if envelope.codec_version != CODEC_VERSION {
        return Err(MembershipError::Codec(format!(
            "unsupported codec version {}",
            envelope.codec_version
        )));
    }
    Ok(envelope.config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_identity() {
        let nc = NodesConfiguration::new_bootstrapping();
        let bytes = serialize(&nc).expect("serialize");
        let back = deserialize(&bytes).expect("deserialize");
        assert_eq!(back, nc);
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        assert!(deserialize(b"not a config").is_err());
        assert!(deserialize(b"").is_err());
    }

    #[test]
    fn test_future_codec_version_rejected() {
        let nc = NodesConfiguration::new_bootstrapping();
        let json = serde_json::json!({
            "codec_version": 999,
            "config": serde_json::to_value(&nc).unwrap(),
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(deserialize(&bytes).is_err());
    }
}
