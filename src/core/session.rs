// This module provides arena-based compilation session management using the bumpalo crate
// to simplify lifetime management in kiln. CompilationSession owns the arena allocator and
// tracks all state shared across the functions of a translation unit: interned strings,
// per-category label counters, the constant data section (deduplicated floating point and
// wide integer constants that cannot be encoded as immediates), and lowering statistics.
// All strings are allocated in the arena and share the session lifetime, which keeps the
// handle and instruction types free of owned strings. SessionStats tracks lowering metrics
// such as function count, instruction count, register evictions and eliminated moves.

//! Arena-based compilation session management.
//!
//! All lowering objects are tied to the session lifetime through arena
//! allocation, eliminating complex lifetime propagation between units.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

use std::collections::{HashMap, HashSet};

use crate::handle::Constant;

/// Arena-based compilation session.
///
/// This manages the lifetime of all lowering objects. Strings produced during
/// lowering (labels, constant identifiers, symbol names) are interned in the
/// arena and have the same lifetime as the session.
pub struct CompilationSession<'a> {
    /// Arena allocator for interned strings.
    arena: &'a Bump,

    /// Interned string storage.
    strings: RefCell<HashSet<&'a str>>,

    /// Running index per label or identifier category.
    counters: RefCell<HashMap<&'a str, u32>>,

    /// Constant identifiers keyed by the constant's bit pattern.
    constants: RefCell<HashMap<u64, &'a str>>,

    /// Constants that must be emitted into the data section.
    constant_data: RefCell<Vec<(&'a str, Constant)>>,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,
}

impl<'a> CompilationSession<'a> {
    /// Create a new compilation session backed by the given arena.
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            arena,
            strings: RefCell::new(HashSet::new()),
            counters: RefCell::new(HashMap::new()),
            constants: RefCell::new(HashMap::new()),
            constant_data: RefCell::new(Vec::new()),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'a Bump {
        self.arena
    }

    /// Intern a string in the arena, deduplicating repeated contents.
    pub fn intern(&self, text: &str) -> &'a str {
        let mut strings = self.strings.borrow_mut();
        if let Some(&interned) = strings.get(text) {
            return interned;
        }

        let interned: &'a str = self.arena.alloc_str(text);
        strings.insert(interned);
        interned
    }

    /// Produce the next running index for the given category.
    pub fn next_index(&self, category: &str) -> u32 {
        let category = self.intern(category);
        let mut counters = self.counters.borrow_mut();
        let counter = counters.entry(category).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }

    /// Produce a fresh local label for the given function.
    pub fn next_label(&self, function: &str) -> &'a str {
        let index = self.next_index(function);
        self.intern(&format!("{}_L{}", function, index))
    }

    /// Produce the data section identifier for a constant, reusing the
    /// identifier of a previously registered constant with the same bits.
    pub fn constant_identifier(&self, function: &str, constant: &Constant) -> &'a str {
        let pattern = constant.bits_pattern();
        if let Some(&identifier) = self.constants.borrow().get(&pattern) {
            return identifier;
        }

        let index = self.next_index("constant");
        let identifier = self.intern(&format!("{}_C{}", function, index));
        self.constants.borrow_mut().insert(pattern, identifier);
        self.constant_data
            .borrow_mut()
            .push((identifier, constant.clone()));
        identifier
    }

    /// All constants registered for the data section, in registration order.
    pub fn constant_data(&self) -> Vec<(&'a str, Constant)> {
        self.constant_data.borrow().clone()
    }

    /// Get a snapshot of the lowering statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Record that a function body was lowered.
    pub fn record_function(&self, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_lowered += 1;
        stats.instructions_built += instructions;
    }

    /// Record that a register occupant was moved out of the way.
    pub fn record_eviction(&self) {
        self.stats.borrow_mut().registers_evicted += 1;
    }

    /// Record a move that was proven redundant and dropped.
    pub fn record_eliminated_move(&self) {
        self.stats.borrow_mut().moves_eliminated += 1;
    }

    /// Record a corrective move inserted at a control flow join.
    pub fn record_corrective_move(&self) {
        self.stats.borrow_mut().corrective_moves += 1;
    }
}

/// Lowering statistics gathered across a session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of function bodies lowered.
    pub functions_lowered: usize,

    /// Number of instructions built across all functions.
    pub instructions_built: usize,

    /// Register occupants moved aside to satisfy an allocation.
    pub registers_evicted: usize,

    /// Moves dropped because source and destination already agreed.
    pub moves_eliminated: usize,

    /// Corrective moves inserted to reconcile control flow joins.
    pub corrective_moves: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lowering statistics:")?;
        writeln!(f, "  Functions lowered: {}", self.functions_lowered)?;
        writeln!(f, "  Instructions built: {}", self.instructions_built)?;
        writeln!(f, "  Registers evicted: {}", self.registers_evicted)?;
        writeln!(f, "  Moves eliminated: {}", self.moves_eliminated)?;
        writeln!(f, "  Corrective moves: {}", self.corrective_moves)
    }
}
