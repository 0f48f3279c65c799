//! Rebuilds `.eh_frame` for an object containing only the included subset
//! of functions: every FDE (frame description entry) whose described range
//! belongs to a function that was not included is dropped, along with its
//! CIE if nothing else references it.
//!
//! There is no retrievable reference implementation of this step in the
//! sources this module was otherwise grounded on (see the project's design
//! notes for that gap); the record layout below follows the standard
//! `.eh_frame` CIE/FDE encoding, and the keep/drop policy follows directly
//! from the inclusion closure computed by the `include` module: an FDE's
//! `pc_begin` field is always carried by a relocation (it is filled in at
//! link time), so whether to keep an FDE is answered by whether that
//! relocation's target symbol was included.

use crate::model::{ElfModel, SecIdx};

struct Record {
    /// Byte offset of the record (including its length field) in the section.
    offset: usize,
    /// Total length in bytes, including the length field itself.
    total_len: usize,
    is_cie: bool,
}

/// Walks `.eh_frame` data into its length-prefixed CIE/FDE records. A
/// 4-byte length of 0 marks the zero terminator record.
fn walk_records(data: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        if len == 0 {
            break;
        }
        // This implementation does not support the 64-bit DWARF extended
        // length escape (0xffffffff followed by a 8-byte length).
        let body_start = offset + 4;
        let body_len = len as usize;
        if body_start + body_len > data.len() {
            break;
        }
        let id = u32::from_le_bytes(
            data[body_start..body_start + 4].try_into().unwrap(),
        );
        records.push(Record {
            offset,
            total_len: 4 + body_len,
            is_cie: id == 0,
        });
        offset = body_start + body_len;
    }
    records
}

/// Rebuilds the `.eh_frame` section at `eh_frame_sec`, keeping only CIE/FDE
/// records whose FDE relocation target is still included, and drops any
/// relocation into a record that was removed. Does nothing if the model
/// carries no `.eh_frame` section.
pub fn rebuild(model: &mut ElfModel, eh_frame_sec: SecIdx) {
    let data = model.section(eh_frame_sec).data.clone();
    let records = walk_records(&data);
    let rela_sec = model.section(eh_frame_sec).rela_section();

    // An FDE at byte offset `r.offset` carries its `pc_begin` field 8 bytes
    // in (4-byte length + 4-byte CIE pointer); a relocation whose r_offset
    // lands there names the function the FDE describes.
    let fde_target_included = |r: &Record| -> bool {
        if r.is_cie {
            return true;
        }
        let pc_begin_offset = (r.offset + 8) as u64;
        let Some(rela_idx) = rela_sec else {
            // No relocations at all (a fully resolved/static .eh_frame):
            // nothing to use to decide inclusion, so conservatively keep it.
            return true;
        };
        model
            .section(rela_idx)
            .relas()
            .iter()
            .find(|rela| rela.r_offset == pc_begin_offset)
            .map(|rela| model.symbols[rela.r_sym as usize].include)
            .unwrap_or(true)
    };

    let keep: Vec<bool> = records.iter().map(fde_target_included).collect();

    // A CIE is kept iff at least one kept FDE points back at it, or it is
    // the only CIE and nothing references it yet (defensively kept).
    let mut keep_final = keep.clone();
    for (i, r) in records.iter().enumerate() {
        if r.is_cie {
            let referenced = records.iter().enumerate().any(|(j, fde)| {
                !fde.is_cie && keep[j] && cie_pointer_targets(&data, fde.offset) == r.offset
            });
            keep_final[i] = referenced;
        }
    }

    let mut new_data = Vec::new();
    let mut offset_map = Vec::new(); // (old_offset, new_offset)
    for (r, keep) in records.iter().zip(keep_final.iter()) {
        if *keep {
            offset_map.push((r.offset, new_data.len()));
            new_data.extend_from_slice(&data[r.offset..r.offset + r.total_len]);
        }
    }
    new_data.extend_from_slice(&0u32.to_le_bytes());

    if let Some(rela_idx) = rela_sec {
        let kept_offsets: std::collections::HashSet<usize> =
            offset_map.iter().map(|(old, _)| *old).collect();
        let fde_pc_begin_offsets: std::collections::HashSet<u64> = records
            .iter()
            .zip(keep_final.iter())
            .filter(|(r, k)| !r.is_cie && **k && kept_offsets.contains(&r.offset))
            .map(|(r, _)| (r.offset + 8) as u64)
            .collect();
        let relas = model.section_mut(rela_idx).relas_mut().unwrap();
        relas.retain(|r| fde_pc_begin_offsets.contains(&r.r_offset));
    }

    let new_size = new_data.len() as u64;
    model.section_mut(eh_frame_sec).data = new_data;
    model.section_mut(eh_frame_sec).size = new_size;
}

/// An FDE's CIE pointer field (the 4 bytes right after its length) is the
/// *backward* byte distance from that field to the CIE's own length field.
fn cie_pointer_targets(data: &[u8], fde_offset: usize) -> usize {
    let field_offset = fde_offset + 4;
    let cie_ptr =
        u32::from_le_bytes(data[field_offset..field_offset + 4].try_into().unwrap()) as usize;
    field_offset.saturating_sub(cie_ptr)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_length_terminator_stops_the_walk() {
        let data = [0u8; 4];
        assert!(walk_records(&data).is_empty());
    }

    #[test]
    fn recognizes_a_cie_by_zero_id() {
        // length=8, id=0 (CIE), then 4 bytes of padding, then terminator.
        let mut data = Vec::new();
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&0u32.to_le_bytes());
        let records = walk_records(&data);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_cie);
    }
}
