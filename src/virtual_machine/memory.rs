//! Script memory: the loaded blob as a flat mutable byte buffer.
//!
//! Besides raw bytes, [`Memory`] tracks:
//! - a sparse overlay of typed allocations (`address -> (type, size)`) used by
//!   diagnostics and by pointer resolution to decide int vs float reads
//! - the set of ranges written during the current tick
//! - an optional journal that lets the engine undo a failed tick

use crate::virtual_machine::data_type::{ALLOCATION_SIZE, DataType};
use crate::virtual_machine::errors::VMError;
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// A known typed allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Type the bytes are interpreted as.
    pub data_type: DataType,
    /// Width in bytes.
    pub size: usize,
}

/// SHA3-256 digest of the memory contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateDigest(pub [u8; 32]);

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Undo log for writes made while a journal is open.
#[derive(Default, Debug)]
struct Journal {
    bytes: Vec<(usize, Vec<u8>)>,
    allocations: Vec<(usize, Option<Allocation>)>,
    dirty_len: usize,
}

/// The flat byte image of a loaded script.
///
/// Code and global variables share one address space. Next to the raw bytes
/// it keeps a typed allocation overlay for globals, the ranges written during
/// the current tick, and an optional journal that lets a failed tick undo its
/// writes.
#[derive(Debug)]
pub struct Memory {
    bytes: Vec<u8>,
    allocations: BTreeMap<usize, Allocation>,
    dirty: Vec<Range<usize>>,
    journal: Option<Journal>,
}

impl Memory {
    /// Wraps a script blob. No allocations are known yet.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            allocations: BTreeMap::new(),
            dirty: Vec::new(),
            journal: None,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn check(&self, address: usize, length: usize) -> Result<Range<usize>, VMError> {
        let size = self.size();
        match address.checked_add(length) {
            Some(end) if end <= size => Ok(address..end),
            _ => Err(VMError::OutOfBoundsAccess {
                address,
                length,
                size,
            }),
        }
    }

    /// Reads `length` bytes starting at `address`.
    pub fn read(&self, address: usize, length: usize) -> Result<&[u8], VMError> {
        let range = self.check(address, length)?;
        Ok(&self.bytes[range])
    }

    /// Reads exactly `N` bytes starting at `address`.
    pub fn read_array<const N: usize>(&self, address: usize) -> Result<[u8; N], VMError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(address, N)?);
        Ok(out)
    }

    pub fn read_u8(&self, address: usize) -> Result<u8, VMError> {
        Ok(self.read_array::<1>(address)?[0])
    }

    pub fn read_u16(&self, address: usize) -> Result<u16, VMError> {
        Ok(u16::from_le_bytes(self.read_array(address)?))
    }

    pub fn read_i32(&self, address: usize) -> Result<i32, VMError> {
        Ok(i32::from_le_bytes(self.read_array(address)?))
    }

    pub fn read_f32(&self, address: usize) -> Result<f32, VMError> {
        Ok(f32::from_le_bytes(self.read_array(address)?))
    }

    /// Overwrites bytes at `address` and marks the range dirty.
    ///
    /// Fails without mutating anything if the range is out of bounds.
    pub fn write(&mut self, address: usize, data: &[u8]) -> Result<(), VMError> {
        let range = self.check(address, data.len())?;
        if let Some(journal) = self.journal.as_mut() {
            journal
                .bytes
                .push((address, self.bytes[range.clone()].to_vec()));
        }
        self.bytes[range.clone()].copy_from_slice(data);
        if !range.is_empty() {
            self.dirty.push(range);
        }
        Ok(())
    }

    /// Stores a typed allocation of `data_type` at `address`.
    ///
    /// Callers encode integers of every width as int32 and floats as float32
    /// (see [`Value::to_storage`](crate::virtual_machine::data_type::Value::to_storage)). The allocation overlay is updated only
    /// here, never by [`Memory::write`].
    pub fn allocate(
        &mut self,
        address: usize,
        data_type: DataType,
        bytes: [u8; ALLOCATION_SIZE],
    ) -> Result<(), VMError> {
        self.write(address, &bytes)?;
        let previous = self.allocations.insert(
            address,
            Allocation {
                data_type,
                size: ALLOCATION_SIZE,
            },
        );
        if let Some(journal) = self.journal.as_mut() {
            journal.allocations.push((address, previous));
        }
        Ok(())
    }

    pub fn allocation(&self, address: usize) -> Option<&Allocation> {
        self.allocations.get(&address)
    }

    /// Returns the allocation covering `address`, if any.
    pub fn allocation_covering(&self, address: usize) -> Option<(usize, &Allocation)> {
        self.allocations
            .range(..=address)
            .next_back()
            .filter(|(start, a)| address < **start + a.size)
            .map(|(start, a)| (*start, a))
    }

    /// Ranges written since the last [`Memory::clear_dirty`].
    pub fn dirty(&self) -> &[Range<usize>] {
        &self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Starts recording undo information for subsequent writes.
    pub fn begin_journal(&mut self) {
        self.journal = Some(Journal {
            dirty_len: self.dirty.len(),
            ..Journal::default()
        });
    }

    /// Keeps every write made since [`Memory::begin_journal`].
    pub fn commit_journal(&mut self) {
        self.journal = None;
    }

    /// Reverts every write made since [`Memory::begin_journal`].
    pub fn rollback_journal(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (address, old) in journal.bytes.into_iter().rev() {
            self.bytes[address..address + old.len()].copy_from_slice(&old);
        }
        for (address, previous) in journal.allocations.into_iter().rev() {
            match previous {
                Some(allocation) => self.allocations.insert(address, allocation),
                None => self.allocations.remove(&address),
            };
        }
        self.dirty.truncate(journal.dirty_len);
    }

    pub fn digest(&self) -> StateDigest {
        let mut hasher = Sha3_256::new();
        hasher.update(&self.bytes);
        StateDigest(hasher.finalize().into())
    }
}
