use hashbrown::HashMap;

use crate::buffer::Buffer;
use crate::error::{NetError, Result};

pub type VariableId = u32;
pub type EntityId = u32;

/// A single replicated field change. Values are `f32`-typed today; spec.md §3
/// requires the design to allow adding typed slots later without breaking
/// existing ids, which is why `variable_id` allocation is centralized in
/// `register_variable` rather than left to callers to pick by hand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkVariableChange {
    pub variable_id: VariableId,
    pub entity_id: EntityId,
    pub value: f32,
}

/// Per-entity per-field dirty tracking. `set` coalesces: the most recent
/// value set within a tick wins, matching the original's
/// `EntityNetworkVariableChanges::floatChanges` map semantics.
pub struct NetworkVariableChangesHandler {
    next_variable_id: VariableId,
    pending: HashMap<(EntityId, VariableId), f32>,
}

impl NetworkVariableChangesHandler {
    pub fn new() -> Self {
        NetworkVariableChangesHandler {
            next_variable_id: 0,
            pending: HashMap::new(),
        }
    }

    pub fn register_variable(&mut self) -> VariableId {
        let id = self.next_variable_id;
        self.next_variable_id += 1;
        id
    }

    pub fn set(&mut self, variable_id: VariableId, entity_id: EntityId, value: f32) {
        self.pending.insert((entity_id, variable_id), value);
    }

    /// Drains all coalesced changes grouped by entity, clearing internal state.
    pub fn collect_all(&mut self) -> HashMap<EntityId, Vec<NetworkVariableChange>> {
        let mut out: HashMap<EntityId, Vec<NetworkVariableChange>> = HashMap::new();
        for ((entity_id, variable_id), value) in self.pending.drain() {
            out.entry(entity_id).or_default().push(NetworkVariableChange {
                variable_id,
                entity_id,
                value,
            });
        }
        out
    }

    /// Reads `u16 count` then `count` changes and hands each one to `assign`.
    pub fn apply(buffer: &mut Buffer, mut assign: impl FnMut(EntityId, VariableId, f32)) -> Result<()> {
        let count = buffer.read_u16();
        for _ in 0..count {
            let variable_id = buffer.read_u32();
            let entity_id = buffer.read_u32();
            let value = buffer.read_f32();
            if buffer.has_overrun() {
                return Err(NetError::BufferOverrun);
            }
            assign(entity_id, variable_id, value);
        }
        Ok(())
    }
}

impl Default for NetworkVariableChangesHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_to_latest_value_within_a_tick() {
        let mut handler = NetworkVariableChangesHandler::new();
        let var = handler.register_variable();
        handler.set(var, 1, 1.0);
        handler.set(var, 1, 2.0);
        handler.set(var, 1, 9.5);

        let changes = handler.collect_all();
        let entity_changes = &changes[&1];
        assert_eq!(entity_changes.len(), 1);
        assert_eq!(entity_changes[0].value, 9.5);
    }

    #[test]
    fn collect_all_clears_pending_state() {
        let mut handler = NetworkVariableChangesHandler::new();
        let var = handler.register_variable();
        handler.set(var, 1, 1.0);
        assert_eq!(handler.collect_all().len(), 1);
        assert!(handler.collect_all().is_empty());
    }

    #[test]
    fn apply_reads_and_dispatches_changes() {
        let mut buffer = Buffer::with_capacity(2 + 2 * 12);
        buffer.write_u16(2).unwrap();
        buffer.write_u32(7).unwrap();
        buffer.write_u32(42).unwrap();
        buffer.write_f32(9.5).unwrap();
        buffer.write_u32(8).unwrap();
        buffer.write_u32(42).unwrap();
        buffer.write_f32(-1.0).unwrap();

        let mut read = Buffer::wrap(buffer.into_written_vec());
        let mut seen = Vec::new();
        NetworkVariableChangesHandler::apply(&mut read, |entity, var, value| {
            seen.push((entity, var, value));
        })
        .unwrap();

        assert_eq!(seen, vec![(42, 7, 9.5), (42, 8, -1.0)]);
    }
}
