use super::types::SlotContent;
use crate::error::{EngineError, Result};

/// How a lost data chunk is brought back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rebuild {
    /// Stripe slots to decode, the lost slot left `None`.
    Decode(Vec<Option<Vec<u8>>>),
    /// No parity folded the lost chunk yet; its records come from the
    /// replicas kept by the parity holders, sorted by key.
    Replicas(Vec<(String, Vec<u8>)>),
}

/// Picks a consistent set of stripe slots for rebuilding data slot `lost`.
///
/// The first parity that folded the lost chunk sets the reference bitmap.
/// Data slots it has not folded count as zero, and parities whose bitmap
/// differs are left out of the decode.
pub fn plan_rebuild(slots: Vec<Option<SlotContent>>, lost: usize, data_chunks: usize) -> Result<Rebuild> {
    let present = slots.iter().flatten().count();
    let insufficient = || EngineError::InsufficientChunks {
        available: present,
        required: data_chunks,
    };
    let len = slots
        .iter()
        .flatten()
        .map(SlotContent::len)
        .max()
        .ok_or_else(insufficient)?;

    let reference = slots.iter().skip(data_chunks).flatten().find_map(|content| match content {
        SlotContent::Parity { pending, .. } if pending.get(lost) == Some(&false) => {
            Some(pending.clone())
        }
        _ => None,
    });
    let Some(reference) = reference else {
        return slots
            .into_iter()
            .skip(data_chunks)
            .flatten()
            .find_map(|content| match content {
                SlotContent::Parity { replicas, .. } => Some(Rebuild::Replicas(replicas)),
                SlotContent::Data(_) => None,
            })
            .ok_or_else(insufficient);
    };

    let decode = slots
        .into_iter()
        .enumerate()
        .map(|(slot, content)| {
            if slot == lost {
                return None;
            }
            if slot < data_chunks && reference.get(slot) == Some(&true) {
                return Some(vec![0; len]);
            }
            match content? {
                SlotContent::Data(bytes) if slot < data_chunks => Some(bytes),
                SlotContent::Parity { bytes, pending, .. }
                    if slot >= data_chunks && pending == reference =>
                {
                    Some(bytes)
                }
                _ => None,
            }
        })
        .collect();
    Ok(Rebuild::Decode(decode))
}
