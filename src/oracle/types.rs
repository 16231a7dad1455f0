use crate::collaborators::DkgIntent;
use crate::store::{be, Indexed};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleStatus {
    Enabled,
    Disabled,
}

/// A DLC oracle created by a completed DKG round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcOracle {
    pub id: u64,
    pub dkg_id: u64,
    /// X-only public key (hex)
    pub pub_key: String,
    pub participants: Vec<String>,
    pub threshold: usize,
    /// Index of the last nonce generated for this oracle
    pub nonce_index: u64,
    pub status: OracleStatus,
    pub created_at: i64,
}

/// A one-time oracle nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcNonce {
    pub index: u64,
    /// X-only nonce point (hex)
    pub nonce: String,
    pub oracle_pub_key: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlcEventKind {
    Price,
    Date,
    Lending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlcEventStatus {
    /// Unbound lending event waiting in the FIFO queue
    Pending,
    /// Outcomes fixed or bound to a loan, waiting for a trigger
    Active,
    Triggered,
    Attested,
}

impl fmt::Display for DlcEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DlcEventStatus::Pending => write!(f, "pending"),
            DlcEventStatus::Active => write!(f, "active"),
            DlcEventStatus::Triggered => write!(f, "triggered"),
            DlcEventStatus::Attested => write!(f, "attested"),
        }
    }
}

/// An outcome set bound to a nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcEvent {
    pub id: u64,
    pub kind: DlcEventKind,
    /// X-only nonce point (hex)
    pub nonce: String,
    /// X-only oracle key (hex)
    pub pub_key: String,
    pub outcomes: Vec<String>,
    pub status: DlcEventStatus,
    pub outcome_index: Option<usize>,
    pub publish_at: i64,
    pub triggered_at: Option<i64>,
    pub signing_request_id: Option<u64>,
}

impl DlcEvent {
    pub fn has_triggered(&self) -> bool {
        matches!(self.status, DlcEventStatus::Triggered | DlcEventStatus::Attested)
    }
}

impl Indexed for DlcEvent {
    fn primary_key(&self) -> Vec<u8> {
        be(self.id).to_vec()
    }

    fn status_key(&self) -> String {
        self.status.to_string()
    }
}

/// The oracle's signature over the realized outcome of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcAttestation {
    pub id: u64,
    pub event_id: u64,
    pub outcome: String,
    /// 64-byte BIP-340 signature (hex)
    pub signature: String,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcmStatus {
    Enabled,
    Disabled,
}

/// Custodian committee holding the DCM side of every vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dcm {
    pub id: u64,
    pub dkg_id: u64,
    /// X-only aggregate key (hex)
    pub pub_key: String,
    pub participants: Vec<String>,
    pub status: DcmStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DkgStatus {
    Pending,
    Completed,
    TimedOut,
}

/// Book-keeping of an in-flight or finished DKG round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgRecord {
    pub id: u64,
    pub intent: DkgIntent,
    pub participants: Vec<String>,
    pub threshold: usize,
    pub batch_size: u32,
    /// Participants that submitted their share
    pub received: Vec<String>,
    pub status: DkgStatus,
    pub expires_at: i64,
    pub created_at: i64,
}

/// Liveness of an oracle participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantLiveness {
    pub participant: String,
    pub alive: bool,
    /// Last nonce DKG the participant took part in
    pub last_dkg_id: u64,
}
