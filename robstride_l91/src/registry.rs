/*!
The motor address book produced by discovery.

A registry is built once per scan and then only read. A rescan produces a
new registry instead of patching the old one, since identifier groupings
depend on probe order and timing and cannot be merged safely.
*/

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, RegistryError};
use crate::frame::Frame;

/// Normalized reply bytes used as an identity proxy for a physical device.
///
/// Each reply contributes its CAN id field, a length and its data bytes.
/// Framing is left out, and the probed id never appears in a reply, so a
/// masked device answering under several ids yields one signature. Equal
/// signatures are evidence, not proof, of one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResponseSignature(#[serde(with = "hex::serde")] Vec<u8>);

impl ResponseSignature {
    /// Build a signature from one or more replies to the same probe sequence
    pub fn from_replies<'a>(replies: impl IntoIterator<Item = &'a Frame>) -> Self {
        let mut bytes = Vec::new();
        for reply in replies {
            bytes.extend_from_slice(&reply.can_id().to_be_bytes());
            bytes.push(reply.payload.len() as u8);
            bytes.extend_from_slice(&reply.payload);
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Discovery-time state of a physical motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorState {
    #[default]
    Unknown,
    /// Answered Activate only
    Discovered,
    /// Answered Activate and LoadParameters
    Activated,
    /// Members disagreed on their signature between passes
    Faulted,
}

/// One physical device and every identifier it answers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalMotor {
    pub canonical_id: u8,
    pub member_ids: BTreeSet<u8>,
    pub signature: ResponseSignature,
    #[serde(default)]
    pub state: MotorState,
}

impl PhysicalMotor {
    /// Create a motor from its members; the canonical id is the lowest one.
    /// Returns `None` for an empty member set.
    pub fn from_members(
        member_ids: BTreeSet<u8>,
        signature: ResponseSignature,
        state: MotorState,
    ) -> Option<Self> {
        let canonical_id = *member_ids.first()?;
        Some(Self {
            canonical_id,
            member_ids,
            signature,
            state,
        })
    }

    /// Check if `id` belongs to this motor
    pub fn answers_to(&self, id: u8) -> bool {
        self.member_ids.contains(&id)
    }

    /// Members as a compact range list, e.g. `8-15,20`
    pub fn describe_members(&self) -> String {
        let mut parts = Vec::new();
        let mut ids = self.member_ids.iter().copied().peekable();

        while let Some(start) = ids.next() {
            let mut end = start;
            while let Some(&next) = ids.peek() {
                if next as u16 != end as u16 + 1 {
                    break;
                }
                end = next;
                ids.next();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }

        parts.join(",")
    }
}

/// Canonical id → physical motor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MotorRegistry {
    motors: BTreeMap<u8, PhysicalMotor>,
}

/// On-disk layout of a saved registry
#[derive(Serialize, Deserialize)]
struct RegistryFile {
    motors: Vec<PhysicalMotor>,
}

impl MotorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry and check the partition invariant
    pub fn from_motors(motors: impl IntoIterator<Item = PhysicalMotor>) -> Result<Self, RegistryError> {
        let registry = Self::from_motors_unchecked(motors);
        registry.validate()?;
        Ok(registry)
    }

    /// Build a registry without validation. Later entries with the same
    /// canonical id replace earlier ones.
    pub(crate) fn from_motors_unchecked(motors: impl IntoIterator<Item = PhysicalMotor>) -> Self {
        let motors = motors
            .into_iter()
            .map(|motor| (motor.canonical_id, motor))
            .collect();
        Self { motors }
    }

    pub fn by_canonical_id(&self, canonical_id: u8) -> Option<&PhysicalMotor> {
        self.motors.get(&canonical_id)
    }

    /// Find the motor that answers to `member_id`
    pub fn by_member_id(&self, member_id: u8) -> Option<&PhysicalMotor> {
        self.motors.values().find(|motor| motor.answers_to(member_id))
    }

    pub fn canonical_ids(&self) -> BTreeSet<u8> {
        self.motors.keys().copied().collect()
    }

    /// Every identifier that answered, across all motors
    pub fn member_ids(&self) -> BTreeSet<u8> {
        self.motors
            .values()
            .flat_map(|motor| motor.member_ids.iter().copied())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhysicalMotor> {
        self.motors.values()
    }

    pub fn len(&self) -> usize {
        self.motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }

    /// Assert the partition invariant: every motor has members, its
    /// canonical id is its lowest member, and no id belongs to two motors.
    /// A failure here is a discovery bug.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut owner: BTreeMap<u8, u8> = BTreeMap::new();

        for (&key, motor) in &self.motors {
            let canonical_id = motor.canonical_id;
            if key != canonical_id {
                return Err(RegistryError::KeyMismatch { key, canonical_id });
            }
            let Some(&lowest) = motor.member_ids.first() else {
                return Err(RegistryError::EmptyGroup { canonical_id });
            };
            if !motor.member_ids.contains(&canonical_id) {
                return Err(RegistryError::CanonicalNotMember { canonical_id });
            }
            if lowest != canonical_id {
                return Err(RegistryError::CanonicalNotLowest { canonical_id, lowest });
            }
            for &member in &motor.member_ids {
                if let Some(first) = owner.insert(member, canonical_id) {
                    return Err(RegistryError::Overlap {
                        member,
                        first,
                        second: canonical_id,
                    });
                }
            }
        }

        Ok(())
    }

    /// One-line summary of every group, e.g. `{8: 8-15} {20: 20}`
    pub fn describe_groups(&self) -> String {
        if self.motors.is_empty() {
            return "(no motors)".to_string();
        }
        self.motors
            .values()
            .map(|motor| format!("{{{}: {}}}", motor.canonical_id, motor.describe_members()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Save as JSON for reuse by later runs
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), BusError> {
        let file = RegistryFile {
            motors: self.motors.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Load a saved registry; the partition invariant is checked again
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, BusError> {
        let content = fs::read_to_string(path.as_ref())?;
        let file: RegistryFile = serde_json::from_str(&content)?;
        Ok(Self::from_motors(file.motors)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn motor(ids: &[u8], signature: &[u8]) -> PhysicalMotor {
        PhysicalMotor::from_members(
            ids.iter().copied().collect(),
            ResponseSignature::from_bytes(signature.to_vec()),
            MotorState::Activated,
        )
        .unwrap()
    }

    #[test]
    fn test_lookup() {
        let registry =
            MotorRegistry::from_motors([motor(&[8, 9, 10, 11], &[1]), motor(&[20], &[2])]).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_canonical_id(8).unwrap().member_ids.len(), 4);
        assert!(registry.by_canonical_id(9).is_none());
        assert_eq!(registry.by_member_id(10).unwrap().canonical_id, 8);
        assert_eq!(registry.by_member_id(20).unwrap().canonical_id, 20);
        assert!(registry.by_member_id(12).is_none());
        assert_eq!(registry.canonical_ids(), [8, 20].into_iter().collect());
    }

    #[test]
    fn test_overlap_is_rejected() {
        let err = MotorRegistry::from_motors([motor(&[8, 9, 10, 11], &[1]), motor(&[11, 12], &[2])])
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Overlap {
                member: 11,
                first: 8,
                second: 11
            }
        );
    }

    #[test]
    fn test_canonical_must_be_lowest_member() {
        let mut bad = motor(&[8, 9], &[1]);
        bad.canonical_id = 9;
        let registry = MotorRegistry::from_motors_unchecked([bad]);
        assert_eq!(
            registry.validate(),
            Err(RegistryError::CanonicalNotLowest {
                canonical_id: 9,
                lowest: 8
            })
        );
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let mut empty = motor(&[5], &[1]);
        empty.member_ids.clear();
        let registry = MotorRegistry::from_motors_unchecked([empty]);
        assert_eq!(
            registry.validate(),
            Err(RegistryError::EmptyGroup { canonical_id: 5 })
        );
    }

    #[test]
    fn test_describe() {
        let m = motor(&[8, 9, 10, 11, 12, 13, 14, 15, 20, 22, 23], &[1]);
        assert_eq!(m.describe_members(), "8-15,20,22-23");

        let registry = MotorRegistry::from_motors([motor(&[1], &[1]), motor(&[3, 4], &[2])]).unwrap();
        assert_eq!(registry.describe_groups(), "{1: 1} {3: 3-4}");
        assert_eq!(MotorRegistry::new().describe_groups(), "(no motors)");
    }

    #[test]
    fn test_file_roundtrip() {
        let registry =
            MotorRegistry::from_motors([motor(&[8, 9, 10], &[0x0f, 0xec]), motor(&[31], &[0x77])])
                .unwrap();

        let temp_file = NamedTempFile::new().unwrap();
        registry.save_to_file(temp_file.path()).unwrap();

        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert!(content.contains("\"0fec\""));
        assert!(content.contains("\"activated\""));

        let loaded = MotorRegistry::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded, registry);
    }

    #[test]
    fn test_load_rejects_overlapping_file() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            r#"{"motors":[
                {"canonical_id":1,"member_ids":[1,2],"signature":"01"},
                {"canonical_id":2,"member_ids":[2],"signature":"02"}
            ]}"#,
        )
        .unwrap();

        let err = MotorRegistry::load_from_file(temp_file.path()).unwrap_err();
        assert!(matches!(err, BusError::Registry(RegistryError::Overlap { member: 2, .. })));
    }

    #[test]
    fn test_signature_from_captured_replies() {
        let motor_1 = hex::decode("415400000ff40836453b4e207130180d0a").unwrap();
        let motor_3 = hex::decode("415400001ff40840643b4e207130180d0a").unwrap();
        let a = crate::frame::decode_reply(&motor_1).unwrap();
        let b = crate::frame::decode_reply(&motor_3).unwrap();
        let alias = Frame::reply(0x0000_0ff4, a.payload.clone());

        // The same device probed under two aliases sends identical bytes
        assert_eq!(ResponseSignature::from_replies([&a]), ResponseSignature::from_replies([&alias]));
        assert_ne!(ResponseSignature::from_replies([&a]), ResponseSignature::from_replies([&b]));
        assert_eq!(
            ResponseSignature::from_replies([&a]).to_hex(),
            "00000ff40836453b4e20713018"
        );

        let parameter = Frame::reply(0x0000_0ff4, vec![0x00, 0xc4]);
        assert_eq!(
            ResponseSignature::from_replies([&a, &parameter]).as_bytes().len(),
            13 + 7
        );
    }
}
