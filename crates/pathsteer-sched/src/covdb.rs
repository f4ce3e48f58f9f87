//! Coverage database loader.
//!
//! Parses the `<module>.bblist` block listings produced by the
//! instrumentation toolchain and serves module-relative address lookups.
//! One listing line per basic block:
//!
//! ```text
//! 0x<start> 0x<end> <function> [gap-marker]
//! ```
//!
//! Lines carrying the gap marker describe unreachable padding: they count
//! toward the byte totals but are excluded from address lookups, so a
//! program counter inside a gap resolves like one outside the module.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use log::{debug, info, warn};
use thiserror::Error;

use crate::host::{ModuleLocation, ModuleResolver};

/// Fourth-field value marking unreachable padding between blocks.
pub const DEFAULT_GAP_MARKER: &str = "MJR_there_is_a_gap";

/// Function name prefixes that mark instrumentation stubs rather than
/// driver code.
const STUB_PREFIXES: [&str; 3] = ["prefn_", "postfn_", "stubwrapper_"];

#[derive(Debug, Error)]
pub enum CovDbError {
    #[error("failed to read block list: {0}")]
    Io(#[from] io::Error),
    #[error("unrecognized fourth field {field:?} at {path}:{line}")]
    BadGapField {
        path: String,
        line: usize,
        field: String,
    },
}

/// One basic block from a listing. `start` and `end` are module relative
/// and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
    pub function: String,
    /// False for instrumentation stubs.
    pub valid: bool,
}

/// Parsed block listing for one module.
#[derive(Debug, Default)]
pub struct LoadedModule {
    name: String,
    blocks: BTreeMap<u64, BlockRange>,
    fn_blocks: BTreeMap<String, u64>,
    num_gaps: u64,
    bytes_in_gaps: u64,
    bytes_total: u64,
}

impl LoadedModule {
    /// Load `<dir>/<name>.bblist`. A missing listing yields an empty
    /// module; a malformed gap field is an error.
    pub fn load(dir: &Path, name: &str, gap_marker: &str) -> Result<Self, CovDbError> {
        let path = dir.join(format!("{name}.bblist"));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "No block list at {}, module {name} starts empty",
                    path.display()
                );
                return Ok(Self {
                    name: name.to_string(),
                    ..Self::default()
                });
            }
            Err(err) => return Err(CovDbError::Io(err)),
        };

        let mut module = Self {
            name: name.to_string(),
            ..Self::default()
        };
        for (lineno, line) in text.lines().enumerate() {
            if !line.starts_with("0x") {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                warn!(
                    "Malformed block line {}:{}: {line:?}",
                    path.display(),
                    lineno + 1
                );
                continue;
            }
            let Some((start, end)) = parse_range(fields[0], fields[1]) else {
                warn!(
                    "Malformed block range {}:{}: {line:?}",
                    path.display(),
                    lineno + 1
                );
                continue;
            };
            // Byte accounting happens before the gap and overlap checks;
            // gaps and rejected duplicates still count toward the total.
            module.bytes_total += end - start + 1;
            if fields.len() > 3 {
                if fields[3] != gap_marker {
                    return Err(CovDbError::BadGapField {
                        path: path.display().to_string(),
                        line: lineno + 1,
                        field: fields[3].to_string(),
                    });
                }
                module.num_gaps += 1;
                module.bytes_in_gaps += end - start + 1;
                continue;
            }
            if let Some(existing) = module.overlapping(start, end) {
                debug!(
                    "Won't insert this block: {start:#x}..{end:#x} overlaps block at {:#x}",
                    existing.start
                );
                continue;
            }
            let function = fields[2].to_string();
            let valid = !STUB_PREFIXES
                .iter()
                .any(|prefix| function.starts_with(prefix));
            *module.fn_blocks.entry(function.clone()).or_insert(0) += 1;
            module.blocks.insert(
                start,
                BlockRange {
                    start,
                    end,
                    function,
                    valid,
                },
            );
        }

        info!("Note that there are {} gaps.", module.num_gaps);
        if module.blocks.is_empty() {
            warn!("No BBs found for module {name}. Check the format of the file.");
        }
        debug_assert_eq!(
            module.fn_blocks.values().sum::<u64>(),
            module.blocks.len() as u64
        );
        info!(
            "Module {name}: {} blocks, {} functions, {} gap bytes, {} bytes listed",
            module.blocks.len(),
            module.fn_blocks.len(),
            module.bytes_in_gaps,
            module.bytes_total
        );
        Ok(module)
    }

    fn overlapping(&self, start: u64, end: u64) -> Option<&BlockRange> {
        self.blocks
            .range(..=end)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.end >= start)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block covering `rel_pc`, if listed.
    pub fn block_at(&self, rel_pc: u64) -> Option<&BlockRange> {
        self.blocks
            .range(..=rel_pc)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.end >= rel_pc)
    }

    /// One past the highest listed address, zero when empty. Gap entries
    /// are unlisted, so a trailing gap shortens the extent.
    pub fn extent(&self) -> u64 {
        self.blocks.values().next_back().map_or(0, |block| block.end + 1)
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn num_functions(&self) -> usize {
        self.fn_blocks.len()
    }

    #[inline]
    pub fn num_gaps(&self) -> u64 {
        self.num_gaps
    }

    #[inline]
    pub fn bytes_in_gaps(&self) -> u64 {
        self.bytes_in_gaps
    }

    #[inline]
    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    /// Listed functions with their block counts.
    pub fn functions(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.fn_blocks.iter().map(|(name, count)| (name.as_str(), *count))
    }
}

fn parse_range(start: &str, end: &str) -> Option<(u64, u64)> {
    let start = u64::from_str_radix(start.strip_prefix("0x")?, 16).ok()?;
    let end = u64::from_str_radix(end.strip_prefix("0x")?, 16).ok()?;
    (end >= start).then_some((start, end))
}

/// A set of loaded modules at their load bases; the production
/// [`ModuleResolver`].
#[derive(Debug, Default)]
pub struct ModuleMap {
    entries: Vec<MapEntry>,
}

#[derive(Debug)]
struct MapEntry {
    module: LoadedModule,
    base: u64,
    primary: bool,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: LoadedModule, base: u64, primary: bool) {
        self.entries.push(MapEntry {
            module,
            base,
            primary,
        });
    }

    pub fn get(&self, name: &str) -> Option<&LoadedModule> {
        self.entries
            .iter()
            .map(|entry| &entry.module)
            .find(|module| module.name() == name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &LoadedModule> + '_ {
        self.entries.iter().map(|entry| &entry.module)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ModuleResolver for ModuleMap {
    fn resolve(&self, pc: u64) -> Option<ModuleLocation> {
        for entry in &self.entries {
            let extent = entry.module.extent();
            if pc >= entry.base && pc - entry.base < extent {
                return Some(ModuleLocation {
                    module: entry.module.name().to_string(),
                    rel_pc: pc - entry.base,
                    primary: entry.primary,
                });
            }
        }
        None
    }

    fn function_at(&self, module: &str, rel_pc: u64) -> Option<String> {
        self.get(module)?
            .block_at(rel_pc)
            .map(|block| block.function.clone())
    }

    fn valid_function_at(&self, module: &str, rel_pc: u64) -> Option<String> {
        self.get(module)?
            .block_at(rel_pc)
            .filter(|block| block.valid)
            .map(|block| block.function.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
