//! Transaction table
//!
//! Maps client-chosen transaction ids to open backend transactions. An id
//! stays reserved while its commit is in flight and is released only when
//! the commit completes (or on rollback).

use crate::dict::DictTransaction;

struct Slot {
    id: u32,
    /// `None` while the transaction is being committed
    ctx: Option<Box<dyn DictTransaction>>,
}

/// Per-connection table of open transactions
#[derive(Default)]
pub struct TransactionTable {
    slots: Vec<Slot>,
}

/// Why a transaction id could not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionLookupError {
    Missing,
    Committing,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is reserved (open or committing)
    pub fn contains(&self, id: u32) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }

    /// Register a new transaction; returns it back if the id is taken
    pub fn insert(
        &mut self,
        id: u32,
        ctx: Box<dyn DictTransaction>,
    ) -> Result<(), Box<dyn DictTransaction>> {
        if self.contains(id) {
            return Err(ctx);
        }
        self.slots.push(Slot { id, ctx: Some(ctx) });
        Ok(())
    }

    /// The open transaction for `id`
    pub fn get_mut(&mut self, id: u32) -> Result<&mut Box<dyn DictTransaction>, TransactionLookupError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or(TransactionLookupError::Missing)?;
        match slot.ctx.as_mut() {
            Some(ctx) => Ok(ctx),
            None => Err(TransactionLookupError::Committing),
        }
    }

    /// Take the transaction out for committing, keeping its id reserved
    pub fn take_for_commit(&mut self, id: u32) -> Result<Box<dyn DictTransaction>, TransactionLookupError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or(TransactionLookupError::Missing)?;
        slot.ctx.take().ok_or(TransactionLookupError::Committing)
    }

    /// Release `id`, returning the transaction if it was still open
    pub fn remove(&mut self, id: u32) -> Option<Box<dyn DictTransaction>> {
        let pos = self.slots.iter().position(|slot| slot.id == id)?;
        self.slots.remove(pos).ctx
    }

    /// Release every id, returning the transactions still open
    pub fn drain(&mut self) -> Vec<(u32, Box<dyn DictTransaction>)> {
        self.slots
            .drain(..)
            .filter_map(|slot| slot.ctx.map(|ctx| (slot.id, ctx)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reserved ids in creation order
    pub fn ids(&self) -> Vec<u32> {
        self.slots.iter().map(|slot| slot.id).collect()
    }
}
