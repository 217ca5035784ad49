//! MessagePack Codec using `rmp-serde`

use crate::traits::CacheCodec;
use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// MessagePack Codec using `rmp-serde`
///
/// Struct fields are encoded by name so payloads written before a field was
/// added still decode.
#[cfg_attr(docsrs, doc(cfg(feature = "msgpack")))]
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl CacheCodec for MsgPackCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize)]
    struct PanelV1 {
        requests: u64,
    }

    #[derive(Deserialize)]
    struct PanelV2 {
        requests: u64,
        #[serde(default)]
        quota: i64,
    }

    #[test]
    fn older_payload_decodes_into_newer_struct() {
        let codec = MsgPackCodec;
        let bytes = codec.serialize(&PanelV1 { requests: 9 }).unwrap_or_default();
        let decoded: PanelV2 = codec.deserialize(&bytes).unwrap_or(PanelV2 { requests: 0, quota: -1 });
        assert_eq!(decoded.requests, 9);
        assert_eq!(decoded.quota, 0);
    }
}
