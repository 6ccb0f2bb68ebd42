//! Word-granularity persistent node storage.
//!
//! The store mirrors an EEPROM-class part: 16-bit words, read and written
//! one at a time (read-modify-write for sub-word fields). Layout:
//!
//! | words | contents                         |
//! |-------|----------------------------------|
//! | 0     | reserved                         |
//! | 1     | node id (hi, lo)                 |
//! | 2     | debug flags (hi octet)           |
//! | 3-6   | node name, 8 octets              |
//! | 7     | node type (hi octet)             |
//! | 8-23  | schedule slots                   |

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use crate::protocol::NodeId;

/// Total store size in 16-bit words.
pub const STORE_WORDS: usize = 24;
/// First schedule slot word.
pub const SCHEDULE_BASE: usize = 8;
/// Number of schedule slots.
pub const SCHEDULE_SLOTS: usize = 16;

const WORD_NODE_ID: usize = 1;
const WORD_DEBUG: usize = 2;
const WORD_NAME: usize = 3;
const WORD_NODE_TYPE: usize = 7;

/// Errors from the file-backed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store image: {0}")]
    Image(#[from] serde_json::Error),
}

/// Word-granularity persistent store contract.
///
/// The typed accessors are defined on top of the two word primitives, so
/// every backend inherits the same layout.
pub trait NvStore {
    fn read_word(&self, index: usize) -> u16;
    fn write_word(&mut self, index: usize, value: u16);

    fn node_id(&self) -> NodeId {
        NodeId(self.read_word(WORD_NODE_ID))
    }

    fn set_node_id(&mut self, id: NodeId) {
        self.write_word(WORD_NODE_ID, id.0);
    }

    fn debug_flags(&self) -> u8 {
        (self.read_word(WORD_DEBUG) >> 8) as u8
    }

    fn set_debug_flags(&mut self, flags: u8) {
        let word = self.read_word(WORD_DEBUG) & 0x00FF;
        self.write_word(WORD_DEBUG, word | u16::from(flags) << 8);
    }

    fn name(&self) -> [u8; 8] {
        let mut name = [0u8; 8];
        for (i, pair) in name.chunks_exact_mut(2).enumerate() {
            let word = self.read_word(WORD_NAME + i);
            pair[0] = (word >> 8) as u8;
            pair[1] = word as u8;
        }
        name
    }

    fn set_name(&mut self, name: &[u8; 8]) {
        for (i, pair) in name.chunks_exact(2).enumerate() {
            self.write_word(WORD_NAME + i, u16::from(pair[0]) << 8 | u16::from(pair[1]));
        }
    }

    fn node_type(&self) -> u8 {
        (self.read_word(WORD_NODE_TYPE) >> 8) as u8
    }

    fn set_node_type(&mut self, node_type: u8) {
        let word = self.read_word(WORD_NODE_TYPE) & 0x00FF;
        self.write_word(WORD_NODE_TYPE, word | u16::from(node_type) << 8);
    }

    fn schedule_slot(&self, slot: usize) -> u16 {
        self.read_word(SCHEDULE_BASE + slot)
    }

    fn set_schedule_slot(&mut self, slot: usize, entry: u16) {
        self.write_word(SCHEDULE_BASE + slot, entry);
    }

    /// Clear the node-specific region (type and schedule); used when the
    /// stored node type does not match the firmware driving it.
    fn erase_node_data(&mut self) {
        for word in WORD_NODE_TYPE..STORE_WORDS {
            self.write_word(word, 0);
        }
    }
}

/// Volatile in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemStore {
    words: [u16; STORE_WORDS],
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self {
            words: [0; STORE_WORDS],
        }
    }
}

impl NvStore for MemStore {
    fn read_word(&self, index: usize) -> u16 {
        debug_assert!(index < STORE_WORDS, "store read at {index}");
        self.words.get(index).copied().unwrap_or(0)
    }

    fn write_word(&mut self, index: usize, value: u16) {
        debug_assert!(index < STORE_WORDS, "store write at {index}");
        if let Some(word) = self.words.get_mut(index) {
            *word = value;
        }
    }
}

/// On-disk image of the store: raw words, little-endian.
#[derive(Serialize, Deserialize)]
struct StoreImage {
    #[serde(with = "serde_bytes")]
    words_le: Vec<u8>,
}

/// File-backed store. Every word write rewrites the small JSON image, so
/// the read-modify-write contract holds across restarts.
#[derive(Debug)]
pub struct FileStore {
    mem: MemStore,
    path: PathBuf,
}

impl FileStore {
    /// Open an existing image or start from a blank store.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when an existing image cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut mem = MemStore::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let image: StoreImage = serde_json::from_str(&text)?;
            for (i, pair) in image.words_le.chunks_exact(2).take(STORE_WORDS).enumerate() {
                mem.words[i] = u16::from_le_bytes([pair[0], pair[1]]);
            }
        }
        Ok(Self { mem, path })
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut words_le = Vec::with_capacity(STORE_WORDS * 2);
        for word in &self.mem.words {
            words_le.extend_from_slice(&word.to_le_bytes());
        }
        let text = serde_json::to_string(&StoreImage { words_le })?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

impl NvStore for FileStore {
    fn read_word(&self, index: usize) -> u16 {
        self.mem.read_word(index)
    }

    fn write_word(&mut self, index: usize, value: u16) {
        self.mem.write_word(index, value);
        if let Err(err) = self.flush() {
            // Nothing at this layer is fatal; the RAM copy stays current.
            warn!(%err, "store flush failed");
        }
    }
}
