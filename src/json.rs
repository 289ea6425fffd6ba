//! The LUKS2 JSON metadata area.
//!
//! Types follow the on-disk JSON exactly: variant and field names are the JSON names, and 64-bit
//! values are encoded as decimal strings.

use crate::{cipher::check_sector_size, error::{LuksError, ParseError}, trim_nul, V2_ALIGN_KEYSLOTS};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Information on the allocated area in the binary keyslots area of a [`LuksKeyslot`].
///
/// Only the `raw` type is currently used.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
// enum variant names must match the JSON values exactly, which are lowercase, so no CamelCase names
#[allow(non_camel_case_types)]
pub enum LuksArea {
	raw {
		/// The area encryption algorithm, in dm-crypt notation (e. g. "aes-xts-plain64").
		encryption: String,
		/// The area encryption key size.
		key_size: u32,
		/// The offset from the device start to the beginning of the binary area in bytes.
		#[serde(with = "type_str")]
		offset: u64,
		/// The area size in bytes.
		#[serde(with = "type_str")]
		size: u64
	},
	#[serde(other)]
	unsupported
}

/// An anti-forensic splitter of a [`LuksKeyslot`]. See
/// [the LUKS1 spec](https://gitlab.com/cryptsetup/cryptsetup/wikis/Specification)
/// for more information.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
// enum variant names must match the JSON values exactly, which are lowercase, so no CamelCase names
#[allow(non_camel_case_types)]
pub enum LuksAf {
	luks1 {
		/// The number of stripes, 4000 for everything `cryptsetup` creates.
		stripes: u32,
		/// The hash algorithm used.
		hash: String
	},
	#[serde(other)]
	unsupported
}

/// Stores information on the PBKDF type and parameters of a [`LuksKeyslot`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
// enum variant names must match the JSON values exactly, which are lowercase, so no CamelCase names
#[allow(non_camel_case_types)]
pub enum LuksKdf {
	pbkdf2 {
		/// The salt for PBKDF (base64 in JSON).
		#[serde(with = "bytes_base64")]
		salt: Vec<u8>,
		/// The hash algorithm for the PKBDF2.
		hash: String,
		/// The PBKDF2 iterations count.
		iterations: u32
	},
	argon2i {
		/// The salt for PBKDF (base64 in JSON).
		#[serde(with = "bytes_base64")]
		salt: Vec<u8>,
		/// The time cost (in fact the iterations).
		time: u32,
		/// The memory cost in kilobytes. If not available, the keyslot cannot be unlocked.
		memory: u32,
		/// The required number of threads (CPU cores number cost).
		cpus: u32
	},
	argon2id {
		/// The salt for PBKDF (base64 in JSON).
		#[serde(with = "bytes_base64")]
		salt: Vec<u8>,
		/// The time cost (in fact the iterations).
		time: u32,
		/// The memory cost in kilobytes. If not available, the keyslot cannot be unlocked.
		memory: u32,
		/// The required number of threads (CPU cores number cost).
		cpus: u32
	},
	#[serde(other)]
	unsupported
}

/// The priority of a [`LuksKeyslot`], stored as an integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
// to match other enum variant names
#[allow(non_camel_case_types)]
pub enum LuksPriority {
	/// The slot should be used only if explicitly stated.
	ignore,
	/// Normal priority keyslot.
	normal,
	/// Tried before normal priority keyslots.
	high
}

impl Serialize for LuksPriority {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u32(*self as u32)
	}
}

impl<'de> Deserialize<'de> for LuksPriority {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		match u32::deserialize(deserializer)? {
			0 => Ok(Self::ignore),
			1 => Ok(Self::normal),
			2 => Ok(Self::high),
			p => Err(de::Error::custom(format!("invalid priority {}", p)))
		}
	}
}

/// A keyslot contains information about stored keys: areas, where binary keyslot data are
/// located, encryption and anti-forensic function used, password-based key derivation function
/// (PBKDF) and related parameters.
///
/// Only the `luks2` type is currently used.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
// enum variant names must match the JSON values exactly, which are lowercase, so no CamelCase names
#[allow(non_camel_case_types)]
pub enum LuksKeyslot {
	luks2 {
		/// The size of the key stored in the slot, in bytes.
		key_size: u32,
		/// The allocated area in the binary keyslots area.
		area: LuksArea,
		/// The PBKDF type and parameters used.
		kdf: LuksKdf,
		/// The anti-forensic splitter.
		af: LuksAf,
		/// The keyslot priority (optional).
		#[serde(default, skip_serializing_if = "Option::is_none")]
		priority: Option<LuksPriority>
	},
	#[serde(other)]
	unsupported
}

impl LuksKeyslot {
	/// The slot priority, [`LuksPriority::normal`] when absent.
	pub fn priority(&self) -> LuksPriority {
		match self {
			Self::luks2 { priority: Some(p), .. } => *p,
			_ => LuksPriority::normal
		}
	}
}

/// The LUKS2 user data integrity protection type, an experimental feature which is only included
/// for parsing compatibility.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct LuksIntegrity {
	#[serde(rename = "type")]
	pub integrity_type: String,
	pub journal_encryption: String,
	pub journal_integrity: String
}

/// The size of a [`LuksSegment`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
// to match other enum variant names
#[allow(non_camel_case_types)]
pub enum LuksSegmentSize {
	/// Signals that the size of the underlying device should be used (dynamic resize).
	dynamic,
	/// The size in bytes.
	fixed(u64)
}

impl Serialize for LuksSegmentSize {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			Self::dynamic => serializer.serialize_str("dynamic"),
			Self::fixed(size) => serializer.serialize_str(&size.to_string())
		}
	}
}

impl<'de> Deserialize<'de> for LuksSegmentSize {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		match s.as_str() {
			"dynamic" => Ok(Self::dynamic),
			x => Ok(Self::fixed(x.parse().map_err(de::Error::custom)?))
		}
	}
}

/// A segment contains a definition of encrypted areas on the disk containing user data
/// (in LUKS1 mentioned as the user data payload). For a normal LUKS device, there is only
/// one data segment present.
///
/// Only the `crypt` type is currently used.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
// enum variant names must match the JSON values exactly, which are lowercase, so no CamelCase names
#[allow(non_camel_case_types)]
pub enum LuksSegment {
	crypt {
		/// The offset from the device start to the beginning of the segment in bytes.
		#[serde(with = "type_str")]
		offset: u64,
		/// The segment size, see [`LuksSegmentSize`].
		size: LuksSegmentSize,
		/// The starting offset for the Initialization Vector.
		#[serde(with = "type_str")]
		iv_tweak: u64,
		/// The segment encryption algorithm in dm-crypt notation (e. g. "aes-xts-plain64").
		encryption: String,
		/// The sector size for the segment (512, 1024, 2048, or 4096 bytes).
		sector_size: u32,
		/// The LUKS2 user data integrity protection type (optional, only included for parsing
		/// compatibility).
		#[serde(default, skip_serializing_if = "Option::is_none")]
		integrity: Option<LuksIntegrity>,
		/// An array of strings marking the segment with additional information (optional).
		#[serde(default, skip_serializing_if = "Option::is_none")]
		flags: Option<Vec<String>>
	},
	#[serde(other)]
	unsupported
}

/// A digest is used to verify that a key decrypted from a keyslot is correct. Digests are assigned
/// to keyslots and segments. If it is not assigned to a segment, then it is a digest for an unbound
/// key. The key digest also specifies the exact key size for the encryption algorithm of the
/// segment.
///
/// Only the `pbkdf2` type compatible with LUKS1 is used.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
// enum variant names must match the JSON values exactly, which are lowercase, so no CamelCase names
#[allow(non_camel_case_types)]
pub enum LuksDigest {
	pbkdf2 {
		/// A list of keyslot numbers that are assigned to the digest.
		#[serde(with = "vec_str", default)]
		keyslots: Vec<u32>,
		/// A list of segment numbers that are assigned to the digest.
		#[serde(with = "vec_str", default)]
		segments: Vec<u32>,
		/// The binary salt for the digest (base64 in JSON).
		#[serde(with = "bytes_base64")]
		salt: Vec<u8>,
		/// The binary digest data (base64 in JSON).
		#[serde(with = "bytes_base64")]
		digest: Vec<u8>,
		/// The hash algorithm for PBKDF2.
		hash: String,
		/// The PBKDF2 iterations count.
		iterations: u32
	},
	#[serde(other)]
	unsupported
}

/// Features a LUKS device requires from the implementation opening it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct LuksRequirements {
	#[serde(default)]
	pub mandatory: Vec<String>
}

/// Global attributes for the LUKS device.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct LuksConfig {
	/// The JSON area size in bytes. Must match the binary header.
	#[serde(with = "type_str")]
	pub json_size: u64,
	/// The binary keyslot area size in bytes. Must be aligned to 4096 bytes.
	#[serde(with = "type_str")]
	pub keyslots_size: u64,
	/// An optional list of persistent flags for the device.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub flags: Option<Vec<String>>,
	/// Optional additional features required by the LUKS device.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub requirements: Option<LuksRequirements>
}

/// A token is an object that can describe how to get a passphrase to unlock a particular keyslot.
/// Tokens are kept as raw JSON objects so they survive a rewrite of the metadata.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct LuksToken {
	#[serde(flatten)]
	pub fields: serde_json::Map<String, serde_json::Value>
}

/// JSON metadata for the device as described
/// [here](https://gitlab.com/cryptsetup/LUKS2-docs/blob/master/luks2_doc_wip.pdf).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct LuksJson {
	/// Objects describing encrypted keys storage areas.
	pub keyslots: BTreeMap<u32, LuksKeyslot>,
	/// Tokens can optionally include additional metadata.
	#[serde(default)]
	pub tokens: BTreeMap<u32, LuksToken>,
	/// Segments describe areas on disk that contain user encrypted data.
	pub segments: BTreeMap<u32, LuksSegment>,
	/// Digests are used to verify that keys decrypted from keyslots are correct. Uses the keys
	/// of keyslots and segments to reference them.
	pub digests: BTreeMap<u32, LuksDigest>,
	/// Persistent header configuration attributes.
	pub config: LuksConfig
}

impl LuksJson {
	/// Attempt to parse a LUKS2 JSON area. Trailing zero padding is ignored.
	pub fn from_slice(data: &[u8]) -> Result<Self, ParseError> {
		let j: Self = serde_json::from_slice(trim_nul(data))?;

		// check that sector sizes of all segments are valid
		for s in j.segments.values() {
			if let LuksSegment::crypt { sector_size, .. } = s {
				if *sector_size == 0 || check_sector_size(*sector_size as usize).is_err() {
					return Err(ParseError::InvalidSectorSize(*sector_size));
				}
			}
		}
		// check that keyslots size is aligned to 4096
		if (j.config.keyslots_size % V2_ALIGN_KEYSLOTS as u64) != 0 {
			return Err(ParseError::KeyslotNotAligned);
		}
		// check that all segments/keyslots references are valid
		if !j.digests.values().all(|d| match d {
			LuksDigest::pbkdf2 { keyslots, segments, .. } => {
				keyslots.iter().all(|k| j.keyslots.contains_key(k))
					&& segments.iter().all(|s| j.segments.contains_key(s))
			},
			LuksDigest::unsupported => true
		}) {
			return Err(ParseError::InvalidReference);
		}

		Ok(j)
	}

	/// Encodes the metadata as compact JSON, without padding.
	pub fn to_vec(&self) -> Result<Vec<u8>, LuksError> {
		Ok(serde_json::to_vec(self)?)
	}
}

// numbers that may exceed 2^53 are stored as strings,
// see https://github.com/serde-rs/json/issues/317#issuecomment-300251188
mod type_str {
	use serde::{de, Deserialize, Deserializer, Serializer};
	use std::{fmt::Display, str::FromStr};

	pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(value)
	}

	pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
	where
		T: FromStr,
		T::Err: Display,
		D: Deserializer<'de>
	{
		let s = String::deserialize(deserializer)?;
		T::from_str(&s).map_err(de::Error::custom)
	}
}

// a Vec<T> where all elements are serialized as strings
mod vec_str {
	use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};
	use std::{fmt::Display, str::FromStr};

	#[allow(clippy::ptr_arg)]
	pub fn serialize<T: Display, S: Serializer>(values: &Vec<T>, serializer: S) -> Result<S::Ok, S::Error> {
		let mut seq = serializer.serialize_seq(Some(values.len()))?;
		for v in values {
			seq.serialize_element(&v.to_string())?;
		}
		seq.end()
	}

	pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
	where
		T: FromStr,
		T::Err: Display,
		D: Deserializer<'de>
	{
		Vec::<String>::deserialize(deserializer)?
			.iter()
			.map(|s| T::from_str(s).map_err(de::Error::custom))
			.collect()
	}
}

mod bytes_base64 {
	use serde::{de, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&base64::encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		base64::decode(s).map_err(de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn minimal(digests: &str) -> String {
		format!(
			r#"{{"keyslots":{{}},"tokens":{{}},
			"segments":{{"0":{{"type":"crypt","offset":"16777216","size":"dynamic","iv_tweak":"0",
				"encryption":"aes-xts-plain64","sector_size":4096}}}},
			"digests":{},
			"config":{{"json_size":"12288","keyslots_size":"16744448"}}}}"#,
			digests
		)
	}

	#[test]
	fn padding_is_ignored() {
		let mut data = minimal("{}").into_bytes();
		data.resize(12288, 0);
		let j = LuksJson::from_slice(&data).unwrap();
		assert_eq!(j.config.json_size, 12288);
		assert_eq!(j.config.keyslots_size, 16744448);
		assert!(j.keyslots.is_empty());
	}

	#[test]
	fn invalid_reference() {
		let digest = r#"{"0":{"type":"pbkdf2","keyslots":["0"],"segments":["0"],"salt":"","digest":"",
			"hash":"sha256","iterations":1000}}"#;
		assert!(matches!(
			LuksJson::from_slice(minimal(digest).as_bytes()),
			Err(ParseError::InvalidReference)
		));
		let digest = r#"{"0":{"type":"pbkdf2","keyslots":[],"segments":["1"],"salt":"","digest":"",
			"hash":"sha256","iterations":1000}}"#;
		assert!(matches!(
			LuksJson::from_slice(minimal(digest).as_bytes()),
			Err(ParseError::InvalidReference)
		));
	}

	#[test]
	fn invalid_geometry() {
		let j = minimal("{}").replace("\"sector_size\":4096", "\"sector_size\":8192");
		assert!(matches!(LuksJson::from_slice(j.as_bytes()), Err(ParseError::InvalidSectorSize(8192))));
		let j = minimal("{}").replace("16744448", "16744449");
		assert!(matches!(LuksJson::from_slice(j.as_bytes()), Err(ParseError::KeyslotNotAligned)));
		assert!(matches!(LuksJson::from_slice(b"{"), Err(ParseError::SerdeError(_))));
	}

	#[test]
	fn unknown_types_are_kept_as_unsupported() {
		let digest = r#"{"0":{"type":"scrypt"}}"#;
		let mut j = minimal(digest);
		j = j.replace(
			r#""keyslots":{}"#,
			r#""keyslots":{"3":{"type":"reencrypt","mode":"encrypt"}}"#
		);
		let j = LuksJson::from_slice(j.as_bytes()).unwrap();
		assert_eq!(j.digests[&0], LuksDigest::unsupported);
		assert_eq!(j.keyslots[&3], LuksKeyslot::unsupported);
		assert_eq!(j.keyslots[&3].priority(), LuksPriority::normal);
	}

	#[test]
	fn strings_and_numbers() {
		let s = LuksSegment::crypt {
			offset: u64::MAX,
			size: LuksSegmentSize::fixed(1 << 40),
			iv_tweak: 7,
			encryption: String::from("serpent-xts-plain64"),
			sector_size: 512,
			integrity: None,
			flags: None
		};
		let v = serde_json::to_value(&s).unwrap();
		assert_eq!(v["type"], "crypt");
		assert_eq!(v["offset"], "18446744073709551615");
		assert_eq!(v["size"], "1099511627776");
		assert_eq!(v["iv_tweak"], "7");
		assert_eq!(v["sector_size"], 512);
		assert!(v.get("flags").is_none());
		assert_eq!(serde_json::from_value::<LuksSegment>(v).unwrap(), s);

		let d = LuksDigest::pbkdf2 {
			keyslots: vec![0, 10],
			segments: vec![0],
			salt: vec![0xff; 3],
			digest: b"digest".to_vec(),
			hash: String::from("sha256"),
			iterations: 1000
		};
		let v = serde_json::to_value(&d).unwrap();
		assert_eq!(v["keyslots"], serde_json::json!(["0", "10"]));
		assert_eq!(v["salt"], "////");
		assert_eq!(v["digest"], "ZGlnZXN0");
	}

	#[test]
	fn priorities() {
		let p: Option<LuksPriority> = serde_json::from_str("2").unwrap();
		assert_eq!(p, Some(LuksPriority::high));
		assert!(serde_json::from_str::<LuksPriority>("3").is_err());
		assert_eq!(serde_json::to_string(&LuksPriority::ignore).unwrap(), "0");
		assert!(LuksPriority::high > LuksPriority::normal);
	}
}
