//! Script layout detection.
//!
//! A compiled script opens with three regions, each introduced by an
//! unconditional jump over it followed by a one-byte marker:
//!
//! ```text
//! goto <models>   marker   global variable storage ...
//! goto <missions> marker   model count, 24-byte model names ...
//! goto <main>     marker   missions start, allocated size, mission count, mission starts ...
//! main code ...
//! mission code ...
//! ```
//!
//! Detection runs once at load time and either yields a complete
//! [`RegionMap`] or fails with [`VMError::InvalidScriptStructure`].

use crate::virtual_machine::decoder::{Decoder, Operand};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{BuiltinOpcode, OPCODE_LEN};
use crate::virtual_machine::memory::Memory;
use crate::virtual_machine::registry::OpcodeRegistry;
use std::fmt;
use std::ops::{Range, RangeInclusive};
use std::str::FromStr;

/// Width of one model name record.
pub const MODEL_NAME_LEN: usize = 24;

/// Script format family; selects the region marker bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GameVariant {
    #[default]
    ViceCity,
    SanAndreas,
}

impl GameVariant {
    /// Marker bytes of the memory, models and missions regions.
    pub const fn markers(&self) -> [u8; 3] {
        match self {
            GameVariant::ViceCity => [0x6d, 0x00, 0x00],
            GameVariant::SanAndreas => [0x73, 0x00, 0x01],
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            GameVariant::ViceCity => "vc",
            GameVariant::SanAndreas => "sa",
        }
    }
}

impl fmt::Display for GameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GameVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vc" => Ok(GameVariant::ViceCity),
            "sa" => Ok(GameVariant::SanAndreas),
            other => Err(format!("unknown game '{}' (expected vc or sa)", other)),
        }
    }
}

/// Region boundaries and tables found at load time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionMap {
    pub memory: Range<usize>,
    pub models: Range<usize>,
    pub mission_table: Range<usize>,
    pub main_code: Range<usize>,
    pub mission_code: Range<usize>,
    /// Model names; the name at index `i` belongs to model id `-i`.
    pub model_names: Vec<String>,
    /// Address range of each mission, indexed by mission id.
    pub missions: Vec<RangeInclusive<usize>>,
    /// Advisory header values of the mission table.
    pub missions_start: i32,
    pub allocated_memory: i32,
}

impl RegionMap {
    pub fn mission(&self, id: usize) -> Option<&RangeInclusive<usize>> {
        self.missions.get(id)
    }

    pub fn mission_containing(&self, address: usize) -> Option<&RangeInclusive<usize>> {
        self.missions.iter().find(|r| r.contains(&address))
    }

    pub fn model_name(&self, id: i32) -> Option<&str> {
        if id > 0 {
            return None;
        }
        self.model_names
            .get(id.unsigned_abs() as usize)
            .map(String::as_str)
    }

    /// Resolves a jump target found at `source`.
    ///
    /// Negative targets are relative to the start of the mission containing
    /// the source address.
    pub fn resolve_target(&self, source: usize, target: i32) -> Result<usize, VMError> {
        if target >= 0 {
            return Ok(target as usize);
        }
        self.mission_containing(source)
            .map(|mission| mission.start() + target.unsigned_abs() as usize)
            .ok_or(VMError::InvalidJumpTarget {
                target: target as i64,
                source_address: source,
            })
    }
}

fn invalid(reason: String) -> VMError {
    VMError::InvalidScriptStructure { reason }
}

/// Locates the three leading regions and parses the model and mission tables.
pub fn detect(
    memory: &Memory,
    registry: &OpcodeRegistry,
    variant: GameVariant,
) -> Result<RegionMap, VMError> {
    detect_regions(memory, registry, variant).map_err(|e| match e {
        VMError::InvalidScriptStructure { .. } => e,
        other => invalid(other.to_string()),
    })
}

fn detect_regions(
    memory: &Memory,
    registry: &OpcodeRegistry,
    variant: GameVariant,
) -> Result<RegionMap, VMError> {
    const NAMES: [&str; 3] = ["memory", "models", "missions"];
    let goto = BuiltinOpcode::Goto.id();
    let decoder = Decoder::new(memory, registry);
    let size = memory.size();

    let mut regions: [Range<usize>; 3] = [0..0, 0..0, 0..0];
    let mut offset = 0;
    for (index, (marker, name)) in variant.markers().into_iter().zip(NAMES).enumerate() {
        let jump = decoder.decode_at(offset)?;
        if jump.instruction.opcode != goto {
            return Err(invalid(format!(
                "expected jump before {} region at {}, found {}",
                name, offset, jump.instruction.opcode
            )));
        }
        let marker_at = jump.instruction.next_address();
        let found = memory.read_u8(marker_at)?;
        if found != marker {
            return Err(invalid(format!(
                "{} marker at {}: expected 0x{:02x}, found 0x{:02x}",
                name, marker_at, marker, found
            )));
        }
        let target = match jump.instruction.args.first().map(|a| a.operand()) {
            Some(Operand::Int(t)) => t,
            _ => return Err(invalid(format!("{} jump has no address", name))),
        };
        let end = usize::try_from(target)
            .ok()
            .filter(|&end| end > marker_at && end <= size)
            .ok_or_else(|| invalid(format!("{} region ends at invalid address {}", name, target)))?;
        let last = index == NAMES.len() - 1;
        if !last && memory.read(end, OPCODE_LEN).ok() != Some(&goto.to_le_bytes(false)[..]) {
            return Err(invalid(format!(
                "{} region end {} does not start with a jump",
                name, end
            )));
        }
        regions[index] = marker_at + 1..end;
        offset = end;
    }
    let [memory_region, models, mission_table] = regions;

    let model_names = read_models(memory, &models)?;

    let base = mission_table.start;
    let missions_start = memory.read_i32(base)?;
    let allocated_memory = memory.read_i32(base + 4)?;
    let count = usize::try_from(memory.read_i32(base + 8)?)
        .map_err(|_| invalid("negative mission count".into()))?;
    let table_end = count
        .checked_mul(4)
        .and_then(|n| n.checked_add(base + 12))
        .filter(|&end| end <= mission_table.end)
        .ok_or_else(|| invalid(format!("mission table of {} entries overflows region", count)))?;
    let starts = (0..count)
        .map(|i| {
            let start = memory.read_i32(base + 12 + i * 4)?;
            usize::try_from(start)
                .ok()
                .filter(|&s| s >= table_end && s < size)
                .ok_or_else(|| invalid(format!("mission {} starts at invalid address {}", i, start)))
        })
        .collect::<Result<Vec<usize>, VMError>>()?;

    let missions = mission_ranges(&starts, size);
    let first_mission = starts.iter().copied().min().unwrap_or(size);

    Ok(RegionMap {
        memory: memory_region,
        models,
        mission_table,
        main_code: table_end..first_mission,
        mission_code: first_mission..size,
        model_names,
        missions,
        missions_start,
        allocated_memory,
    })
}

fn read_models(memory: &Memory, region: &Range<usize>) -> Result<Vec<String>, VMError> {
    let count = usize::try_from(memory.read_i32(region.start)?)
        .map_err(|_| invalid("negative model count".into()))?;
    let first = region.start + 4;
    count
        .checked_mul(MODEL_NAME_LEN)
        .and_then(|n| n.checked_add(first))
        .filter(|&end| end <= region.end)
        .ok_or_else(|| invalid(format!("model table of {} entries overflows region", count)))?;
    (0..count)
        .map(|i| {
            let raw = memory.read(first + i * MODEL_NAME_LEN, MODEL_NAME_LEN)?;
            let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
        })
        .collect()
}

/// Each mission runs up to the next higher start; the last to the end of memory.
fn mission_ranges(starts: &[usize], size: usize) -> Vec<RangeInclusive<usize>> {
    let mut sorted = starts.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    starts
        .iter()
        .map(|&start| {
            let next = sorted
                .iter()
                .copied()
                .find(|&s| s > start)
                .unwrap_or(size);
            start..=next - 1
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::utils::{ScriptBuilder, layout};

    fn detect_blob(blob: Vec<u8>, variant: GameVariant) -> Result<RegionMap, VMError> {
        let memory = Memory::new(blob);
        let registry = OpcodeRegistry::builtin().unwrap();
        detect(&memory, &registry, variant)
    }

    fn sample(variant: GameVariant) -> ScriptBuilder {
        let mut b = layout(variant, 16, &["", "cop", "taxi"], &["m0", "m1"]);
        b.op(0x0001).int8(0);
        b.label("m0").op(0x004E);
        b.label("m1").op(0x004E);
        b
    }

    #[test]
    fn detects_vice_city_layout() {
        let b = sample(GameVariant::ViceCity);
        let size = b.position();
        let map = detect_blob(b.build(), GameVariant::ViceCity).unwrap();

        assert_eq!(map.memory, 8..24);
        assert_eq!(map.models.start, 24 + 8);
        assert_eq!(map.model_names, vec!["", "cop", "taxi"]);
        assert_eq!(map.model_name(-2), Some("taxi"));
        assert_eq!(map.model_name(1), None);

        let main = b.address("main");
        assert_eq!(map.main_code, main..b.address("m0"));
        assert_eq!(map.mission_code, b.address("m0")..size);
        assert_eq!(
            map.missions,
            vec![
                b.address("m0")..=b.address("m1") - 1,
                b.address("m1")..=size - 1
            ]
        );
    }

    #[test]
    fn boundaries_increase_monotonically() {
        let map = detect_blob(sample(GameVariant::ViceCity).build(), GameVariant::ViceCity).unwrap();
        assert!(map.memory.end <= map.models.start);
        assert!(map.models.end <= map.mission_table.start);
        assert!(map.mission_table.end <= map.main_code.start);
        assert!(map.main_code.end <= map.mission_code.start);
    }

    #[test]
    fn san_andreas_markers() {
        let blob = sample(GameVariant::SanAndreas).build();
        assert!(detect_blob(blob.clone(), GameVariant::SanAndreas).is_ok());
        assert!(matches!(
            detect_blob(blob, GameVariant::ViceCity),
            Err(VMError::InvalidScriptStructure { .. })
        ));
    }

    #[test]
    fn corrupted_second_marker_fails() {
        let b = sample(GameVariant::ViceCity);
        let mut blob = b.build();
        let second_marker = b.address("__models") + 7;
        blob[second_marker] = 0x42;
        let err = detect_blob(blob, GameVariant::ViceCity).unwrap_err();
        assert!(matches!(err, VMError::InvalidScriptStructure { ref reason } if reason.contains("models")));
    }

    #[test]
    fn region_must_end_at_a_jump() {
        let b = sample(GameVariant::ViceCity);
        let mut blob = b.build();
        blob[b.address("__models")] = 0x01;
        assert!(matches!(
            detect_blob(blob, GameVariant::ViceCity),
            Err(VMError::InvalidScriptStructure { .. })
        ));
    }

    #[test]
    fn truncated_blob_is_a_structure_error() {
        let mut blob = sample(GameVariant::ViceCity).build();
        blob.truncate(10);
        assert!(matches!(
            detect_blob(blob, GameVariant::ViceCity),
            Err(VMError::InvalidScriptStructure { .. })
        ));
    }

    #[test]
    fn mission_ranges_partition_the_tail() {
        assert_eq!(
            mission_ranges(&[100, 250, 400], 1000),
            vec![100..=249, 250..=399, 400..=999]
        );
        assert_eq!(
            mission_ranges(&[400, 100, 250], 1000),
            vec![400..=999, 100..=249, 250..=399]
        );
    }

    #[test]
    fn no_missions_leaves_main_to_end() {
        let mut b = layout(GameVariant::ViceCity, 4, &[], &[]);
        b.op(0x004E);
        let size = b.position();
        let map = detect_blob(b.build(), GameVariant::ViceCity).unwrap();
        assert_eq!(map.main_code.end, size);
        assert!(map.mission_code.is_empty());
        assert!(map.missions.is_empty());
    }

    #[test]
    fn negative_targets_resolve_inside_missions() {
        let b = sample(GameVariant::ViceCity);
        let map = detect_blob(b.build(), GameVariant::ViceCity).unwrap();
        let m1 = b.address("m1");
        assert_eq!(map.resolve_target(m1, -2).unwrap(), m1 + 2);
        assert_eq!(map.resolve_target(m1, 30).unwrap(), 30);
        assert!(matches!(
            map.resolve_target(b.address("main"), -2),
            Err(VMError::InvalidJumpTarget { .. })
        ));
    }

    #[test]
    fn variant_parses_from_short_name() {
        assert_eq!("sa".parse::<GameVariant>().unwrap(), GameVariant::SanAndreas);
        assert_eq!(GameVariant::ViceCity.to_string(), "vc");
        assert!("iii".parse::<GameVariant>().is_err());
    }
}
