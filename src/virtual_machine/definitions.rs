//! Parsers for external opcode definition files.
//!
//! Two inputs are supported:
//! - the opcode catalogue, an INI-style file with one `XXXX=N,notes` record
//!   per opcode (`N = -1` declares variable arguments)
//! - an optional C header of symbolic names, with entries like
//!   `/* 0001 */ { ..., "WAIT" }`

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::OpcodeId;
use crate::virtual_machine::registry::OpcodeRegistry;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// One catalogue line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpcodeRecord {
    pub opcode: OpcodeId,
    /// Declared argument count, `-1` for variable arguments.
    pub argument_count: i32,
    pub notes: String,
}

/// Parses the opcode catalogue.
///
/// Section headers, comments, blank lines and keys that are not four hex
/// digits are skipped. A record with a malformed count fails with the line
/// number.
pub fn parse_catalogue(text: &str) -> Result<Vec<OpcodeRecord>, VMError> {
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        let Some((key, rest)) = line.split_once('=') else {
            continue;
        };
        if key.len() != 4 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            continue;
        }
        let invalid = |reason: String| VMError::InvalidDefinition {
            line: index + 1,
            reason,
        };
        let opcode: OpcodeId = key.parse().map_err(invalid)?;
        let (count, notes) = rest.split_once(',').unwrap_or((rest, ""));
        let argument_count: i32 = count
            .trim()
            .parse()
            .map_err(|_| invalid(format!("invalid argument count '{}'", count.trim())))?;
        if argument_count < -1 {
            return Err(invalid(format!(
                "invalid argument count '{}'",
                argument_count
            )));
        }
        records.push(OpcodeRecord {
            opcode,
            argument_count,
            notes: notes.trim().to_string(),
        });
    }
    Ok(records)
}

/// Parses symbolic opcode names from a C header.
pub fn parse_symbols(text: &str) -> HashMap<OpcodeId, String> {
    text.lines().filter_map(parse_symbol_line).collect()
}

fn parse_symbol_line(line: &str) -> Option<(OpcodeId, String)> {
    let start = line.find("/* ")?;
    let rest = &line[start + 3..];
    let hex = rest.split_whitespace().next()?;
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let opcode = u16::from_str_radix(hex, 16).ok()?;
    let after = &rest[hex.len()..];
    let open = after.find('"')?;
    let quoted = &after[open + 1..];
    let name = &quoted[..quoted.find('"')?];
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }
    Some((OpcodeId(opcode), name.to_string()))
}

/// Loads the catalogue (and optional symbol header) and binds the built-in
/// opcodes on top of it.
pub fn load_registry(catalogue: &Path, symbols: Option<&Path>) -> Result<OpcodeRegistry, VMError> {
    let read = |path: &Path| {
        fs::read_to_string(path).map_err(|e| VMError::Io(format!("{}: {}", path.display(), e)))
    };
    let mut builder = OpcodeRegistry::builder();
    if let Some(path) = symbols {
        builder.symbols(parse_symbols(&read(path)?));
    }
    builder.catalogue(parse_catalogue(&read(catalogue)?)?)?;
    builder.with_builtins()?;
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOGUE: &str = "\
[DATA]
DATE=2004-11-01

[OPCODES]
; comment
0000=0,NOP
0001=1,wait %1d% ms
004f=-1,create_thread %1p%
00A5=5,%5d% = create_car %1o% at %2d% %3d% %4d%
";

    #[test]
    fn parses_records_and_skips_noise() {
        let records = parse_catalogue(CATALOGUE).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[1],
            OpcodeRecord {
                opcode: OpcodeId(0x0001),
                argument_count: 1,
                notes: "wait %1d% ms".into(),
            }
        );
        assert_eq!(records[2].opcode, OpcodeId(0x004F));
        assert_eq!(records[2].argument_count, -1);
        assert_eq!(records[3].opcode, OpcodeId(0x00A5));
    }

    #[test]
    fn malformed_count_reports_line() {
        let err = parse_catalogue("0000=0,NOP\n0001=x,wait\n").unwrap_err();
        assert!(matches!(err, VMError::InvalidDefinition { line: 2, .. }));
        let err = parse_catalogue("0001=-4,bad\n").unwrap_err();
        assert!(matches!(err, VMError::InvalidDefinition { line: 1, .. }));
    }

    #[test]
    fn parses_symbol_header() {
        let header = r#"
/* 0001 */ { 1, "WAIT" },
/* 004E */ { 0, "TERMINATE_THIS_SCRIPT" },
/* nope */ { 0, "IGNORED" },
/* 0002 */ { 1, "" },
"#;
        let symbols = parse_symbols(header);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[&OpcodeId(0x0001)], "WAIT");
        assert_eq!(symbols[&OpcodeId(0x004E)], "TERMINATE_THIS_SCRIPT");
    }

    #[test]
    fn duplicate_records_fail_registry_build() {
        let records = parse_catalogue("0001=1,a\n0001=1,b\n").unwrap();
        let mut builder = OpcodeRegistry::builder();
        assert!(matches!(
            builder.catalogue(records),
            Err(VMError::DuplicateOpcode { .. })
        ));
    }

    #[test]
    fn loads_registry_from_files() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let catalogue = dir.path().join("VICESCM.ini");
        let symbols = dir.path().join("opcodes.h");
        fs::write(&catalogue, CATALOGUE).unwrap();
        fs::write(&symbols, "/* 00A5 */ { 5, \"CREATE_CAR\" },\n").unwrap();

        let registry = load_registry(&catalogue, Some(&symbols)).unwrap();
        assert_eq!(
            registry.definition(OpcodeId(0x00A5)).unwrap().symbol,
            "create_car"
        );
        assert!(!registry.is_bound(OpcodeId(0x00A5)));
        assert!(registry.is_bound(OpcodeId(0x0001)));
        assert_eq!(registry.definition(OpcodeId(0x0000)).unwrap().symbol, "opcode_0000");
    }

    #[test]
    fn missing_catalogue_is_an_io_error() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let err = load_registry(&dir.path().join("missing.ini"), None)
            .err()
            .unwrap();
        assert!(matches!(err, VMError::Io(_)));
    }
}
