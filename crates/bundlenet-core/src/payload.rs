//! Bundle payload codec.
//!
//! The plaintext of a bundle is itself a container with entries:
//!
//! | Entry | Contents |
//! |-------|----------|
//! | `bundle.id` | plain bundle id (see [`crate::bundle_id`]) |
//! | `ack` | u64 BE counter of the last bundle received from the counterpart, `0` for none |
//! | `adu/{app}/{seq}` | raw ADU bytes, `seq` zero-padded to 20 digits |
//!
//! ADUs for one application form a contiguous sequence range.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bundle_id::BundleId;
use crate::container::{self, ContainerBuilder};
use crate::error::{CoreError, Result};
use crate::types::{AppId, PeerId};

/// Ack value meaning "nothing received yet".
pub const HEARTBEAT_ACK: u64 = 0;

const ENTRY_BUNDLE_ID: &str = "bundle.id";
const ENTRY_ACK: &str = "ack";
const ADU_PREFIX: &str = "adu/";

/// An application data unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adu {
    /// The counterpart this ADU is exchanged with.
    pub peer: PeerId,
    pub app: AppId,
    pub seq: u64,
    pub data: Bytes,
}

impl Adu {
    pub fn new(peer: PeerId, app: AppId, seq: u64, data: impl Into<Bytes>) -> Self {
        Self {
            peer,
            app,
            seq,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decrypted bundle contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePayload {
    pub bundle_id: BundleId,
    /// Piggy-backed acknowledgement.
    pub ack: u64,
    /// ADUs ordered by (app, seq).
    pub adus: Vec<Adu>,
}

impl BundlePayload {
    pub fn new(bundle_id: BundleId, ack: u64, mut adus: Vec<Adu>) -> Self {
        adus.sort_by(|a, b| (&a.app, a.seq).cmp(&(&b.app, b.seq)));
        Self {
            bundle_id,
            ack,
            adus,
        }
    }

    /// A bundle with no ADUs, still carrying the ack.
    pub fn is_empty(&self) -> bool {
        self.adus.is_empty()
    }

    /// Acknowledgement, or `None` for a heartbeat.
    pub fn ack(&self) -> Option<u64> {
        (self.ack != HEARTBEAT_ACK).then_some(self.ack)
    }

    /// Inclusive sequence range per application.
    pub fn ranges(&self) -> BTreeMap<AppId, (u64, u64)> {
        let mut ranges: BTreeMap<AppId, (u64, u64)> = BTreeMap::new();
        for adu in &self.adus {
            ranges
                .entry(adu.app.clone())
                .and_modify(|r| {
                    r.0 = r.0.min(adu.seq);
                    r.1 = r.1.max(adu.seq);
                })
                .or_insert((adu.seq, adu.seq));
        }
        ranges
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut builder = ContainerBuilder::new();
        builder.add(ENTRY_BUNDLE_ID, self.bundle_id.encode().to_vec())?;
        builder.add(ENTRY_ACK, self.ack.to_be_bytes().to_vec())?;
        for adu in &self.adus {
            builder.add(adu_entry_name(&adu.app, adu.seq), adu.data.clone())?;
        }
        Ok(builder.to_bytes())
    }

    /// Decode a payload received from `from`.
    ///
    /// Decoded ADUs are attributed to `from`.
    pub fn decode(bytes: &[u8], from: PeerId) -> Result<Self> {
        let container = container::unpack(bytes)?;
        let bundle_id = BundleId::decode(container.require(ENTRY_BUNDLE_ID)?)?;
        let ack_bytes: [u8; 8] = container
            .require(ENTRY_ACK)?
            .as_ref()
            .try_into()
            .map_err(|_| CoreError::MalformedPayload("ack must be 8 bytes".into()))?;
        let ack = u64::from_be_bytes(ack_bytes);

        let mut adus = Vec::new();
        for (name, data) in container.into_entries() {
            if name == ENTRY_BUNDLE_ID || name == ENTRY_ACK {
                continue;
            }
            let (app, seq) = parse_adu_entry_name(&name)?;
            adus.push(Adu::new(from, app, seq, data));
        }

        let payload = Self::new(bundle_id, ack, adus);
        payload.check_contiguous()?;
        Ok(payload)
    }

    fn check_contiguous(&self) -> Result<()> {
        for pair in self.adus.windows(2) {
            if pair[0].app == pair[1].app && pair[1].seq != pair[0].seq + 1 {
                return Err(CoreError::MalformedPayload(format!(
                    "gap in {} after seq {}",
                    pair[0].app, pair[0].seq
                )));
            }
        }
        Ok(())
    }
}

fn adu_entry_name(app: &AppId, seq: u64) -> String {
    format!("{ADU_PREFIX}{app}/{seq:020}")
}

fn parse_adu_entry_name(name: &str) -> Result<(AppId, u64)> {
    let malformed = || CoreError::MalformedPayload(format!("unexpected entry {name:?}"));
    let rest = name.strip_prefix(ADU_PREFIX).ok_or_else(malformed)?;
    let (app, seq) = rest.rsplit_once('/').ok_or_else(malformed)?;
    let app = AppId::new(app).map_err(|_| malformed())?;
    let seq: u64 = seq.parse().map_err(|_| malformed())?;
    if seq == 0 {
        return Err(malformed());
    }
    Ok((app, seq))
}
