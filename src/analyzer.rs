use std::collections::HashMap;

use crate::ast::{Ast, NodeId, NodeKind};

/// Name-to-slot assignment for every variable in a program.
#[derive(Debug)]
pub struct Analysis {
    slots: HashMap<String, u32>,
    pub count: usize,
}

impl Analysis {
    /// Slot of a resolved variable. Every identifier in the analyzed tree
    /// has an entry; the emitter only asks about nodes from that tree.
    pub fn slot(&self, name: &str) -> u32 {
        self.slots[name]
    }
}

/// Assign each distinct variable a dense slot, first occurrence first.
///
/// The tree allocates parents before children and siblings left to right,
/// so a single scan in node order visits identifiers in source order and
/// no tree walk is needed.
pub fn analyze(ast: &Ast) -> Analysis {
    let mut slots = HashMap::new();
    for id in 0..ast.len() as NodeId {
        if ast.kind(id) == NodeKind::Identifier {
            let next = slots.len() as u32;
            slots.entry(ast.text(id).to_string()).or_insert(next);
        }
    }
    let count = slots.len();
    Analysis { slots, count }
}
