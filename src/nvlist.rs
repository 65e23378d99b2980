//! The property tree that label payloads are built from, and its packed
//! on-disk form.
//!
//! A tree is an ordered list of named values; names are unique within a
//! list and inserting an existing name replaces it. The packed encoding
//! is self-describing: every pair carries a one-byte type tag and the
//! byte length of its payload, so a reader that does not recognize a tag
//! skips the payload and keeps going. That is what lets old software
//! import pools whose labels carry keys from the future.

use std::io::{Cursor, Write};

use bincode::{deserialize_from, serialize_into};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum NvError {
    #[snafu(display("packed tree exceeds {} bytes", limit))]
    TooSmall { limit: usize },
    #[snafu(display("serialization error: {}", source))]
    Serialize { source: bincode::Error },
    #[snafu(display("deserialization error: {}", source))]
    Deserialize { source: bincode::Error },
    #[snafu(display("truncated payload for {}", name))]
    Truncated { name: String },
}

/// Key names recognized in label payloads.
pub mod keys {
    pub const VERSION: &str = "version";
    pub const POOL_NAME: &str = "name";
    pub const POOL_STATE: &str = "state";
    pub const POOL_TXG: &str = "txg";
    pub const POOL_GUID: &str = "pool_guid";
    pub const CREATE_TXG: &str = "create_txg";
    pub const TOP_GUID: &str = "top_guid";
    pub const GUID: &str = "guid";
    pub const VDEV_TREE: &str = "vdev_tree";
    pub const VDEV_TYPE: &str = "type";
    pub const VDEV_ID: &str = "id";
    pub const VDEV_PATH: &str = "path";
    pub const VDEV_DEVID: &str = "devid";
    pub const VDEV_PHYSPATH: &str = "phys_path";
    pub const VDEV_NPARITY: &str = "nparity";
    pub const VDEV_WHOLE_DISK: &str = "whole_disk";
    pub const VDEV_METASLAB_ARRAY: &str = "metaslab_array";
    pub const VDEV_METASLAB_SHIFT: &str = "metaslab_shift";
    pub const VDEV_ASHIFT: &str = "ashift";
    pub const VDEV_ASIZE: &str = "asize";
    pub const VDEV_IS_LOG: &str = "is_log";
    pub const VDEV_DTL: &str = "dtl";
    pub const VDEV_CHILDREN: &str = "children";
    pub const VDEV_STATS: &str = "vdev_stats";
    pub const VDEV_OFFLINE: &str = "offline";
    pub const VDEV_FAULTED: &str = "faulted";
    pub const VDEV_DEGRADED: &str = "degraded";
    pub const VDEV_REMOVED: &str = "removed";
    pub const VDEV_UNSPARE: &str = "unspare";
    pub const VDEV_NOT_PRESENT: &str = "not_present";
    pub const VDEV_IS_SPARE: &str = "is_spare";
}

const TAG_UINT64: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_LIST: u8 = 3;
const TAG_LIST_ARRAY: u8 = 4;
const TAG_UINT64_ARRAY: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum NvValue {
    Uint64(u64),
    Uint64Array(Vec<u64>),
    Str(String),
    List(NvList),
    ListArray(Vec<NvList>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NvList {
    pairs: Vec<(String, NvValue)>,
}

impl NvList {
    pub fn new() -> Self {
        NvList {
            pairs: Vec::new(),
        }
    }

    /// Insert a value, replacing any existing pair with the same name.
    pub fn set(&mut self, name: &str, value: NvValue) {
        if let Some(pair) = self.pairs.iter_mut().find(|(n, _)| n == name) {
            pair.1 = value;
        } else {
            self.pairs.push((name.to_string(), value));
        }
    }

    pub fn add_u64(&mut self, name: &str, value: u64) {
        self.set(name, NvValue::Uint64(value));
    }

    pub fn add_u64_array(&mut self, name: &str, value: Vec<u64>) {
        self.set(name, NvValue::Uint64Array(value));
    }

    pub fn add_str(&mut self, name: &str, value: &str) {
        self.set(name, NvValue::Str(value.to_string()));
    }

    pub fn add_list(&mut self, name: &str, value: NvList) {
        self.set(name, NvValue::List(value));
    }

    pub fn add_list_array(&mut self, name: &str, value: Vec<NvList>) {
        self.set(name, NvValue::ListArray(value));
    }

    pub fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(NvValue::Uint64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64_array(&self, name: &str) -> Option<&[u64]> {
        match self.get(name) {
            Some(NvValue::Uint64Array(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(NvValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&NvList> {
        match self.get(name) {
            Some(NvValue::List(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_list_array(&self, name: &str) -> Option<&[NvList]> {
        match self.get(name) {
            Some(NvValue::ListArray(v)) => Some(v),
            _ => None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, NvError> {
        let mut cur = Cursor::new(Vec::new());
        serialize_into(&mut cur, &(self.pairs.len() as u64))
            .context(Serialize {})?;
        for (name, value) in &self.pairs {
            serialize_into(&mut cur, name).context(Serialize {})?;
            let (tag, payload) = value.encode()?;
            serialize_into(&mut cur, &tag).context(Serialize {})?;
            serialize_into(&mut cur, &(payload.len() as u64))
                .context(Serialize {})?;
            cur.write_all(&payload).unwrap();
        }
        Ok(cur.into_inner())
    }

    /// Pack the tree into its on-disk form. Fails with `TooSmall` when
    /// the encoding does not fit `limit` bytes; this is the single
    /// out-of-room failure mode of the encoder.
    pub fn pack(&self, limit: usize) -> Result<Vec<u8>, NvError> {
        let bytes = self.encode()?;
        if bytes.len() > limit {
            return Err(NvError::TooSmall {
                limit,
            });
        }
        Ok(bytes)
    }

    /// Decode a packed tree. Pairs with unknown type tags are skipped.
    /// Trailing bytes after the encoded pairs are ignored, so a caller
    /// may hand in the whole zero-padded phys region.
    pub fn unpack(buf: &[u8]) -> Result<NvList, NvError> {
        let mut cur = Cursor::new(buf);
        let count: u64 = deserialize_from(&mut cur).context(Deserialize {})?;
        let mut list = NvList::new();
        for _ in 0 .. count {
            let name: String =
                deserialize_from(&mut cur).context(Deserialize {})?;
            let tag: u8 = deserialize_from(&mut cur).context(Deserialize {})?;
            let len: u64 = deserialize_from(&mut cur).context(Deserialize {})?;
            let pos = cur.position() as usize;
            if pos + len as usize > buf.len() {
                return Err(NvError::Truncated {
                    name,
                });
            }
            let payload = &buf[pos .. pos + len as usize];
            cur.set_position((pos + len as usize) as u64);
            if let Some(value) = NvValue::decode(tag, payload)? {
                list.set(&name, value);
            }
        }
        Ok(list)
    }
}

impl NvValue {
    fn encode(&self) -> Result<(u8, Vec<u8>), NvError> {
        let mut cur = Cursor::new(Vec::new());
        let tag = match self {
            NvValue::Uint64(v) => {
                serialize_into(&mut cur, v).context(Serialize {})?;
                TAG_UINT64
            }
            NvValue::Uint64Array(v) => {
                serialize_into(&mut cur, v).context(Serialize {})?;
                TAG_UINT64_ARRAY
            }
            NvValue::Str(v) => {
                serialize_into(&mut cur, v).context(Serialize {})?;
                TAG_STRING
            }
            NvValue::List(v) => {
                cur.write_all(&v.encode()?).unwrap();
                TAG_LIST
            }
            NvValue::ListArray(v) => {
                serialize_into(&mut cur, &(v.len() as u64))
                    .context(Serialize {})?;
                for list in v {
                    let bytes = list.encode()?;
                    serialize_into(&mut cur, &(bytes.len() as u64))
                        .context(Serialize {})?;
                    cur.write_all(&bytes).unwrap();
                }
                TAG_LIST_ARRAY
            }
        };
        Ok((tag, cur.into_inner()))
    }

    /// Returns `None` for an unrecognized tag.
    fn decode(tag: u8, payload: &[u8]) -> Result<Option<NvValue>, NvError> {
        let mut cur = Cursor::new(payload);
        let value = match tag {
            TAG_UINT64 => NvValue::Uint64(
                deserialize_from(&mut cur).context(Deserialize {})?,
            ),
            TAG_UINT64_ARRAY => NvValue::Uint64Array(
                deserialize_from(&mut cur).context(Deserialize {})?,
            ),
            TAG_STRING => NvValue::Str(
                deserialize_from(&mut cur).context(Deserialize {})?,
            ),
            TAG_LIST => NvValue::List(NvList::unpack(payload)?),
            TAG_LIST_ARRAY => {
                let count: u64 =
                    deserialize_from(&mut cur).context(Deserialize {})?;
                let mut lists = Vec::new();
                for _ in 0 .. count {
                    let len: u64 =
                        deserialize_from(&mut cur).context(Deserialize {})?;
                    let pos = cur.position() as usize;
                    if pos + len as usize > payload.len() {
                        return Err(NvError::Truncated {
                            name: String::from("list array"),
                        });
                    }
                    lists.push(NvList::unpack(
                        &payload[pos .. pos + len as usize],
                    )?);
                    cur.set_position((pos + len as usize) as u64);
                }
                NvValue::ListArray(lists)
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}
