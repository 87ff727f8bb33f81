// This module implements the allocation unit, the per-function engine that owns
// the instruction stream, the value slots, the register table and the scope
// stack. Lowering is a replay: the caller first records abstract instructions,
// then the unit runs a simulate pass that resolves variable accesses and scope
// transitions and computes value lifetimes, and finally a build pass that picks
// registers and finalizes every instruction into machine operations. During the
// build pass an instruction may insert new instructions in front of itself; the
// stream is reindexed and lifetimes recomputed so positions stay consistent.
// Register allocation walks a fixed cascade: an available volatile register, an
// available non-volatile register, a releasable volatile register, a releasable
// non-volatile register, and finally failure when everything is locked.

//! The per-function allocation and lowering unit.

use bumpalo::Bump;
use hashbrown::HashMap;
use log::{debug, trace};

use crate::arch;
use crate::core::error::{CompileError, CompileResult};
use crate::core::format::Format;
use crate::core::session::CompilationSession;
use crate::core::target::TargetConfig;
use crate::handle::{Handle, HandleKind};
use crate::instruction::{self, InstrId, Instruction};
use crate::register::{flag, Reg, RegisterDescriptor};
use crate::scope::{Scope, ScopeId, Variable, VariableId};
use crate::value::{Slot, SlotId, ValueId, UNTOUCHED};

/// Signature of the function being lowered.
#[derive(Debug, Clone)]
pub struct FunctionSignature<'a> {
    pub name: &'a str,
    pub parameters: Vec<VariableId>,
    pub return_format: Option<Format>,
}

/// Phase the unit is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitMode {
    /// Recording abstract instructions.
    Default,
    /// Resolving variable accesses and lifetimes.
    Simulate,
    /// Choosing registers and finalizing operations.
    Build,
}

/// The per-function lowering engine.
pub struct Unit<'a> {
    pub session: &'a CompilationSession<'a>,
    pub target: TargetConfig,
    pub function: FunctionSignature<'a>,

    pub registers: Vec<RegisterDescriptor>,

    /// Cell table mapping values onto slots. Joined values share a slot.
    pub(crate) cells: Vec<SlotId>,
    pub(crate) slots: Vec<Slot<'a>>,

    pub(crate) variables: Vec<Variable<'a>>,

    pub(crate) instructions: Vec<Instruction<'a>>,
    /// Execution order of the instruction stream.
    pub(crate) order: Vec<InstrId>,
    /// Position of the instruction currently being processed.
    pub position: i32,
    /// Index into `order` of the instruction currently being processed.
    pub(crate) anchor: usize,
    pub mode: UnitMode,

    pub(crate) scopes: Vec<Scope>,
    pub(crate) scope: Option<ScopeId>,

    /// Unit states recorded at labels, for reconciling backward edges.
    pub(crate) states: HashMap<&'a str, Vec<(VariableId, Handle<'a>)>>,

    /// Running counter for temporary memory and stack allocation identities.
    identities: u32,
    /// High water mark of temporary memory handed out so far, in bytes.
    pub(crate) temporary_memory: i32,
}

impl<'a> Unit<'a> {
    pub fn new(
        session: &'a CompilationSession<'a>,
        target: TargetConfig,
        function: FunctionSignature<'a>,
    ) -> Self {
        Self {
            session,
            target,
            function,
            registers: arch::registers(&target),
            cells: Vec::new(),
            slots: Vec::new(),
            variables: Vec::new(),
            instructions: Vec::new(),
            order: Vec::new(),
            position: UNTOUCHED,
            anchor: 0,
            mode: UnitMode::Default,
            scopes: Vec::new(),
            scope: None,
            states: HashMap::new(),
            identities: 0,
            temporary_memory: 0,
        }
    }

    pub fn arena(&self) -> &'a Bump {
        self.session.arena()
    }

    // --- Variables ---------------------------------------------------------

    pub fn declare_variable(&mut self, variable: Variable<'a>) -> VariableId {
        let id = VariableId(self.variables.len() as u32);
        self.variables.push(variable);
        id
    }

    pub fn variable(&self, id: VariableId) -> &Variable<'a> {
        &self.variables[id.0 as usize]
    }

    // --- Values and slots --------------------------------------------------

    pub fn new_value(&mut self, format: Format) -> ValueId {
        let slot = SlotId(self.slots.len() as u32);
        self.slots.push(Slot::new(format));
        let value = ValueId(self.cells.len() as u32);
        self.cells.push(slot);
        value
    }

    pub(crate) fn slot_of(&self, value: ValueId) -> &Slot<'a> {
        &self.slots[self.cells[value.0 as usize].0 as usize]
    }

    pub(crate) fn slot_of_mut(&mut self, value: ValueId) -> &mut Slot<'a> {
        &mut self.slots[self.cells[value.0 as usize].0 as usize]
    }

    pub fn handle(&self, value: ValueId) -> Handle<'a> {
        self.slot_of(value).handle.clone()
    }

    pub fn set_handle(&mut self, value: ValueId, handle: Handle<'a>) {
        self.slot_of_mut(value).handle = handle;
    }

    pub fn format(&self, value: ValueId) -> Format {
        self.slot_of(value).format
    }

    pub fn set_format(&mut self, value: ValueId, format: Format) {
        self.slot_of_mut(value).format = format;
    }

    /// Whether two values share a slot.
    pub fn same(&self, a: ValueId, b: ValueId) -> bool {
        self.cells[a.0 as usize] == self.cells[b.0 as usize]
    }

    /// Join `value` onto `onto` so that both observe the same storage.
    /// The surviving slot keeps the combined lifetime.
    pub fn join(&mut self, value: ValueId, onto: ValueId) {
        let from = self.cells[value.0 as usize];
        let to = self.cells[onto.0 as usize];
        if from == to {
            return;
        }

        let absorbed = self.slots[from.0 as usize].clone();
        let target = &mut self.slots[to.0 as usize];
        target.merge_lifetime(&absorbed);

        for cell in self.cells.iter_mut() {
            if *cell == from {
                *cell = to;
            }
        }
    }

    /// Record a use of the value and of the values captured by its handle.
    pub fn use_value_at(&mut self, value: ValueId, position: i32) {
        self.slot_of_mut(value).use_at(position);
        for inner in self.handle(value).inner_values() {
            self.use_value_at(inner, position);
        }
    }

    pub fn is_expiring(&self, value: ValueId, position: i32) -> bool {
        self.slot_of(value).is_expiring(position)
    }

    pub fn is_used_after(&self, value: ValueId, position: i32) -> bool {
        self.slot_of(value).is_used_after(position)
    }

    pub fn is_valid_at(&self, value: ValueId, position: i32) -> bool {
        self.slot_of(value).is_valid_at(position)
    }

    /// The register the value currently lives in, if any.
    pub fn register_of(&self, value: ValueId) -> Option<Reg> {
        self.slot_of(value).handle.as_register()
    }

    /// Classification of the value's current handle for operand matching.
    pub fn kind_of(&self, value: ValueId) -> HandleKind {
        match self.slot_of(value).handle {
            Handle::None | Handle::Pack { .. } => HandleKind::None,
            Handle::Constant(_) => HandleKind::Constant,
            Handle::Register(reg) => {
                if self.registers[reg.index()].is_media() {
                    HandleKind::MediaRegister
                } else {
                    HandleKind::Register
                }
            }
            Handle::Expression { .. } => HandleKind::Expression,
            Handle::DataSection { address: true, .. } => HandleKind::Expression,
            _ => HandleKind::Memory,
        }
    }

    // --- Registers ---------------------------------------------------------

    pub fn register(&self, reg: Reg) -> &RegisterDescriptor {
        &self.registers[reg.index()]
    }

    pub fn register_mut(&mut self, reg: Reg) -> &mut RegisterDescriptor {
        &mut self.registers[reg.index()]
    }

    pub fn register_by_name(&self, name: &str) -> CompileResult<Reg> {
        self.registers
            .iter()
            .position(|r| r.full_name() == name)
            .map(|index| Reg(index as u8))
            .ok_or_else(|| CompileError::MissingRegister {
                name: name.to_string(),
            })
    }

    pub fn register_by_flag(&self, role: u32) -> CompileResult<Reg> {
        self.registers
            .iter()
            .position(|r| r.has_flag(role))
            .map(|index| Reg(index as u8))
            .ok_or_else(|| CompileError::MissingRegister {
                name: format!("role {}", role),
            })
    }

    pub fn stack_pointer(&self) -> CompileResult<Reg> {
        self.register_by_flag(flag::STACK_POINTER)
    }

    pub fn numerator(&self) -> CompileResult<Reg> {
        self.register_by_flag(flag::NUMERATOR)
    }

    pub fn remainder(&self) -> CompileResult<Reg> {
        self.register_by_flag(flag::REMAINDER)
    }

    pub fn shift_register(&self) -> CompileResult<Reg> {
        self.register_by_flag(flag::SHIFT)
    }

    pub fn zero_register(&self) -> CompileResult<Reg> {
        self.register_by_flag(flag::ZERO)
    }

    pub fn return_register(&self, media: bool) -> CompileResult<Reg> {
        self.register_by_flag(if media { flag::DECIMAL_RETURN } else { flag::RETURN })
    }

    /// Whether the register's current contents may be discarded at the given
    /// position. A register whose occupant has moved elsewhere is stale and
    /// counts as free.
    pub fn is_register_available(&self, reg: Reg, position: i32) -> bool {
        let register = &self.registers[reg.index()];
        if register.is_reserved() || register.is_locked() {
            return false;
        }
        match register.occupant {
            None => true,
            Some(occupant) => {
                let slot = self.slot_of(occupant);
                slot.handle != Handle::Register(reg) || slot.is_expiring(position)
            }
        }
    }

    /// Whether the register's occupant is live but may be moved aside.
    pub fn is_register_releasable(&self, reg: Reg) -> bool {
        let register = &self.registers[reg.index()];
        !register.is_reserved() && !register.is_locked() && register.occupant.is_some()
    }

    pub fn lock_register(&mut self, reg: Reg) {
        self.registers[reg.index()].lock();
    }

    pub fn unlock_register(&mut self, reg: Reg) {
        self.registers[reg.index()].unlock();
    }

    /// Lock every register captured by the handle, directly or through inner
    /// values. Returns the locked registers for later unlocking.
    pub fn lock_handle(&mut self, handle: &Handle<'a>) -> Vec<Reg> {
        let mut locked = Vec::new();
        if let Some(reg) = handle.as_register() {
            self.lock_register(reg);
            locked.push(reg);
        }
        for inner in handle.inner_values() {
            if let Some(reg) = self.register_of(inner) {
                self.lock_register(reg);
                locked.push(reg);
            }
        }
        locked
    }

    pub fn unlock_all(&mut self, locked: &[Reg]) {
        for reg in locked {
            self.unlock_register(*reg);
        }
    }

    /// Make the value the occupant of the register and point its storage at
    /// the register.
    pub fn occupy(&mut self, reg: Reg, value: ValueId) {
        self.registers[reg.index()].occupant = Some(value);
        self.set_handle(value, Handle::Register(reg));
    }

    /// Detach the register from its occupant. The occupant's handle is
    /// cleared only if it still points here.
    pub fn reset_register(&mut self, reg: Reg) {
        if let Some(occupant) = self.registers[reg.index()].occupant.take() {
            if self.slot_of(occupant).handle == Handle::Register(reg) {
                self.set_handle(occupant, Handle::None);
            }
        }
    }

    /// Reset every volatile register. Used after calls.
    pub fn reset_volatile_registers(&mut self) {
        for index in 0..self.registers.len() {
            let reg = Reg(index as u8);
            if self.registers[index].is_volatile() && !self.registers[index].is_reserved() {
                self.reset_register(reg);
            }
        }
    }

    /// Pick the next register for allocation. The cascade prefers available
    /// volatile registers, then available non-volatile ones, then releasing a
    /// volatile occupant, then a non-volatile one.
    pub fn next_register(&mut self, media: bool, avoid: &[Reg]) -> CompileResult<Reg> {
        self.next_register_in(media, avoid, false)
    }

    /// Pick a callee saved register or fail. Used where the value must
    /// survive an upcoming call; exhaustion is an error, never a volatile
    /// fallback.
    pub fn next_non_volatile_register(&mut self, media: bool, avoid: &[Reg]) -> CompileResult<Reg> {
        self.next_register_in(media, avoid, true)
    }

    fn next_register_in(
        &mut self,
        media: bool,
        avoid: &[Reg],
        callee_saved_only: bool,
    ) -> CompileResult<Reg> {
        let position = self.position;

        let pick = |unit: &Unit<'a>, volatile: bool, available: bool| -> Option<Reg> {
            if callee_saved_only && volatile {
                return None;
            }
            for index in 0..unit.registers.len() {
                let reg = Reg(index as u8);
                let register = &unit.registers[index];
                if register.is_media() != media
                    || register.is_volatile() != volatile
                    || avoid.contains(&reg)
                {
                    continue;
                }
                let usable = if available {
                    unit.is_register_available(reg, position)
                } else {
                    unit.is_register_releasable(reg)
                };
                if usable {
                    return Some(reg);
                }
            }
            None
        };

        if let Some(reg) = pick(self, true, true).or_else(|| pick(self, false, true)) {
            trace!("allocating {}", self.registers[reg.index()].full_name());
            self.reset_register(reg);
            return Ok(reg);
        }

        if let Some(reg) = pick(self, true, false).or_else(|| pick(self, false, false)) {
            debug!("releasing {}", self.registers[reg.index()].full_name());
            self.release(reg)?;
            return Ok(reg);
        }

        let reason = if callee_saved_only {
            "no callee saved register is available"
        } else {
            "all registers are locked"
        };
        Err(CompileError::RegisterAllocation {
            reason: reason.to_string(),
        })
    }

    /// Move the register's occupant out of the way: to the variable's stack
    /// home when the occupant carries a variable, otherwise to a fresh
    /// temporary memory slot.
    pub fn release(&mut self, reg: Reg) -> CompileResult<()> {
        let occupant = match self.registers[reg.index()].occupant {
            Some(occupant) => occupant,
            None => return Ok(()),
        };

        if self.slot_of(occupant).handle != Handle::Register(reg) {
            self.registers[reg.index()].occupant = None;
            return Ok(());
        }

        let destination = match self.variable_home_of(occupant) {
            Some(home) => home,
            None => self.temporary_memory(self.format(occupant).bytes() as i32),
        };

        self.session.record_eviction();
        crate::memory::relocate(self, occupant, destination)?;
        self.registers[reg.index()].occupant = None;
        Ok(())
    }

    /// The stack home handle of the variable carried by this value, if the
    /// value is some scope's current value for a variable.
    pub fn variable_home_of(&self, value: ValueId) -> Option<Handle<'a>> {
        for scope in &self.scopes {
            for (&variable, &held) in scope.variables.iter() {
                if self.same(held, value) {
                    return Some(Handle::StackVariable {
                        variable,
                        offset: 0,
                    });
                }
            }
        }
        None
    }

    /// The variable carried by this value, if any.
    pub fn variable_of(&self, value: ValueId) -> Option<VariableId> {
        for scope in &self.scopes {
            for (&variable, &held) in scope.variables.iter() {
                if self.same(held, value) {
                    return Some(variable);
                }
            }
        }
        None
    }

    pub fn next_identity(&mut self) -> u32 {
        let identity = self.identities;
        self.identities += 1;
        identity
    }

    /// Hand out a fresh temporary memory slot of the given size.
    pub fn temporary_memory(&mut self, bytes: i32) -> Handle<'a> {
        let identity = self.next_identity();
        self.temporary_memory += bytes.max(8);
        Handle::TemporaryMemory {
            identity,
            offset: 0,
        }
    }

    // --- Scopes ------------------------------------------------------------

    /// Enter a new scope requiring the given variables. Values are inherited
    /// from the enclosing scope where present, otherwise the variable starts
    /// in its stack home.
    pub fn enter_scope(&mut self, actives: Vec<VariableId>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        let mut scope = Scope::new(self.scope, actives.clone());

        for variable in actives {
            let inherited = self
                .scope
                .and_then(|outer| self.scope_value(outer, variable));
            let value = match inherited {
                Some(value) => value,
                None => {
                    let format = self.variable(variable).format;
                    let value = self.new_value(format);
                    self.set_handle(
                        value,
                        Handle::StackVariable {
                            variable,
                            offset: 0,
                        },
                    );
                    scope.loads.push((variable, value));
                    value
                }
            };
            scope.set_value(variable, value);
        }

        self.scopes.push(scope);
        self.scope = Some(id);
        id
    }

    /// Leave the current scope, returning to the enclosing one.
    pub fn exit_scope(&mut self) {
        if let Some(current) = self.scope {
            let outer = self.scopes[current.0 as usize].outer;
            self.scopes[current.0 as usize].end = Some(self.position);
            self.scope = outer;
        }
    }

    fn scope_value(&self, scope: ScopeId, variable: VariableId) -> Option<ValueId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = &self.scopes[id.0 as usize];
            if let Some(value) = scope.value_of(variable) {
                return Some(value);
            }
            current = scope.outer;
        }
        None
    }

    /// Current value of a variable, searched through the scope chain.
    pub fn variable_value(&self, variable: VariableId) -> CompileResult<ValueId> {
        self.scope
            .and_then(|scope| self.scope_value(scope, variable))
            .ok_or_else(|| CompileError::Scope {
                reason: format!(
                    "variable {} is not active in the current scope",
                    self.variables[variable.0 as usize].name
                ),
            })
    }

    /// Value a parameter variable received when the root scope loaded it.
    pub fn parameter_value(&self, variable: VariableId) -> Option<ValueId> {
        self.scopes.first().and_then(|scope| {
            scope
                .loads
                .iter()
                .find(|(candidate, _)| *candidate == variable)
                .map(|(_, value)| *value)
        })
    }

    /// Make the value the variable's current value in the innermost scope
    /// that has the variable active.
    pub fn write_variable(&mut self, variable: VariableId, value: ValueId) -> CompileResult<()> {
        let mut current = self.scope;
        while let Some(id) = current {
            if self.scopes[id.0 as usize].variables.contains_key(&variable) {
                self.scopes[id.0 as usize].set_value(variable, value);
                return Ok(());
            }
            current = self.scopes[id.0 as usize].outer;
        }
        Err(CompileError::Scope {
            reason: format!(
                "variable {} is not active in the current scope",
                self.variables[variable.0 as usize].name
            ),
        })
    }

    // --- Label states ------------------------------------------------------

    pub fn record_state(&mut self, label: &'a str, state: Vec<(VariableId, Handle<'a>)>) {
        self.states.insert(label, state);
    }

    pub fn state_at(&self, label: &str) -> Option<&Vec<(VariableId, Handle<'a>)>> {
        self.states.get(label)
    }

    // --- Instruction stream ------------------------------------------------

    pub fn instruction(&self, id: InstrId) -> &Instruction<'a> {
        &self.instructions[id.index()]
    }

    pub fn instruction_mut(&mut self, id: InstrId) -> &mut Instruction<'a> {
        &mut self.instructions[id.index()]
    }

    /// Instruction identifiers in execution order.
    pub fn order(&self) -> &[InstrId] {
        &self.order
    }

    /// Append or insert an instruction. While recording, the instruction goes
    /// to the end of the stream. During the build pass it is inserted in
    /// front of the instruction currently being built, the stream is
    /// reindexed and the new instruction is built immediately.
    pub fn add(&mut self, mut instruction: Instruction<'a>) -> CompileResult<InstrId> {
        instruction.scope = self.scope;
        let id = InstrId(self.instructions.len() as u32);

        match self.mode {
            UnitMode::Default => {
                instruction.position = self.order.len() as i32;
                self.instructions.push(instruction);
                self.order.push(id);
            }
            UnitMode::Simulate => {
                self.instructions.push(instruction);
                self.order.insert(self.anchor, id);
                self.anchor += 1;
                self.reindex();
                instruction::simulate_one(self, id)?;
            }
            UnitMode::Build => {
                self.instructions.push(instruction);
                self.order.insert(self.anchor, id);
                self.anchor += 1;
                self.reindex();
                instruction::build_one(self, id)?;
            }
        }
        Ok(id)
    }

    /// Reassign positions along the execution order and recompute every
    /// lifetime from the instruction dependencies.
    pub fn reindex(&mut self) {
        for (position, id) in self.order.iter().enumerate() {
            self.instructions[id.index()].position = position as i32;
        }
        if self.anchor > 0 && self.anchor <= self.order.len() {
            self.position = (self.anchor as i32) - 1;
        }

        for slot in self.slots.iter_mut() {
            slot.reset_lifetime();
        }
        for index in 0..self.order.len() {
            let id = self.order[index];
            let position = self.instructions[id.index()].position;
            let values = self.instructions[id.index()].dependencies();
            for value in values {
                self.use_value_at(value, position);
            }
        }
    }

    /// Resolve variable accesses, scope transitions and lifetimes.
    pub fn simulate_pass(&mut self) -> CompileResult<()> {
        debug!("simulating {} ({} instructions)", self.function.name, self.order.len());
        self.mode = UnitMode::Simulate;
        self.anchor = 0;
        self.reindex();

        while self.anchor < self.order.len() {
            let id = self.order[self.anchor];
            self.position = self.instructions[id.index()].position;
            self.scope = self.instructions[id.index()].scope;
            instruction::simulate_one(self, id)?;
            self.anchor += 1;
        }

        self.mode = UnitMode::Default;
        Ok(())
    }

    /// Choose registers and finalize every instruction.
    pub fn build_pass(&mut self) -> CompileResult<()> {
        debug!("building {} ({} instructions)", self.function.name, self.order.len());
        self.mode = UnitMode::Build;
        self.anchor = 0;
        self.reindex();

        while self.anchor < self.order.len() {
            let id = self.order[self.anchor];
            self.position = self.instructions[id.index()].position;
            self.scope = self.instructions[id.index()].scope;
            instruction::build_one(self, id)?;
            self.anchor += 1;
        }

        self.mode = UnitMode::Default;
        self.session.record_function(self.order.len());
        Ok(())
    }
}
