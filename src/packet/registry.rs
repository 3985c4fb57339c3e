//! Id to prototype table for id-framed packets
//!
//! The table is immutable. [`PacketRegistry::register`] builds a new table
//! holding the previous entries plus one, so a published registry can be
//! shared between connections behind an `Arc` and read without locking.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{PacketDescriptor, ReadablePacket};
use crate::error::{NetworkError, Result};

/// Largest id a registry accepts; the table is indexed by id
pub const MAX_PACKET_ID: u32 = u16::MAX as u32;

/// Factory for fresh packet instances of one type
pub trait PacketPrototype<P>: Send + Sync {
    /// Wire id
    fn id(&self) -> u32;

    /// Type name
    fn name(&self) -> &'static str;

    /// Manufacture a fresh instance and decode `body` into it
    fn new_instance(&self, body: &[u8]) -> Result<P>;
}

/// Long-lived instance cloned for every decoded message; never mutated itself
struct Prototype<T, P> {
    template: T,
    _packet: PhantomData<fn() -> P>,
}

impl<T, P> PacketPrototype<P> for Prototype<T, P>
where
    T: PacketDescriptor + ReadablePacket + Clone + Into<P> + Send + Sync,
{
    fn id(&self) -> u32 {
        T::ID
    }

    fn name(&self) -> &'static str {
        T::NAME
    }

    fn new_instance(&self, mut body: &[u8]) -> Result<P> {
        let mut packet = self.template.clone();
        packet.read(&mut body)?;
        Ok(packet.into())
    }
}

type Slot<P> = Option<Arc<dyn PacketPrototype<P>>>;

/// Immutable id-indexed prototype table
pub struct PacketRegistry<P> {
    table: Arc<[Slot<P>]>,
}

impl<P: 'static> PacketRegistry<P> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::from(Vec::new()),
        }
    }

    /// Produce a new registry with `prototype` added.
    ///
    /// Fails when another type already owns the id or the id exceeds
    /// [`MAX_PACKET_ID`].
    pub fn register<T>(&self, prototype: T) -> Result<Self>
    where
        T: PacketDescriptor + ReadablePacket + Clone + Into<P> + Send + Sync + 'static,
    {
        if T::ID > MAX_PACKET_ID {
            return Err(NetworkError::config(format!(
                "packet {} has id {} above the maximum {}",
                T::NAME,
                T::ID,
                MAX_PACKET_ID
            )));
        }

        let index = T::ID as usize;
        if let Some(Some(existing)) = self.table.get(index) {
            return Err(NetworkError::DuplicatePacketId {
                id: T::ID,
                existing: existing.name(),
                duplicate: T::NAME,
            });
        }

        let mut table: Vec<Slot<P>> = self.table.to_vec();
        if table.len() <= index {
            table.resize_with(index + 1, || None);
        }
        table[index] = Some(Arc::new(Prototype {
            template: prototype,
            _packet: PhantomData,
        }));

        tracing::debug!(id = T::ID, name = T::NAME, "registered packet prototype");
        Ok(Self {
            table: Arc::from(table),
        })
    }
}

impl<P> PacketRegistry<P> {
    /// Look up the prototype registered for `id`
    pub fn resolve_prototype_by_id(&self, id: u32) -> Result<&Arc<dyn PacketPrototype<P>>> {
        self.table
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(NetworkError::UnknownPacketId(id))
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.table
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id as u32)
    }

    /// Number of registered packet types
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.iter().filter(|slot| slot.is_some()).count()
    }

    /// Check if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: 'static> Default for PacketRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for PacketRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<P> fmt::Debug for PacketRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<(u32, &'static str)> = self
            .table
            .iter()
            .flatten()
            .map(|prototype| (prototype.id(), prototype.name()))
            .collect();
        f.debug_struct("PacketRegistry")
            .field("packets", &entries)
            .finish()
    }
}
