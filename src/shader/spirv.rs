//! Minimal SPIR-V introspection.
//!
//! Walks the instruction stream of a SPIR-V module and reports the resources a
//! shader stage declares: uniform buffers (with the members the stage actually
//! references), combined image-samplers and stage inputs. Only the handful of
//! instructions needed for that are decoded; everything else is skipped by word
//! count. Malformed input yields a [`SpirvError`], never a panic.

use std::collections::HashMap;
use thiserror::Error;

/// First word of every SPIR-V module.
pub const MAGIC: u32 = 0x0723_0203;

const HEADER_WORDS: usize = 5;

pub(crate) mod op {
    pub const NAME: u32 = 5;
    pub const MEMBER_NAME: u32 = 6;
    pub const TYPE_BOOL: u32 = 20;
    pub const TYPE_INT: u32 = 21;
    pub const TYPE_FLOAT: u32 = 22;
    pub const TYPE_VECTOR: u32 = 23;
    pub const TYPE_MATRIX: u32 = 24;
    pub const TYPE_IMAGE: u32 = 25;
    pub const TYPE_SAMPLER: u32 = 26;
    pub const TYPE_SAMPLED_IMAGE: u32 = 27;
    pub const TYPE_ARRAY: u32 = 28;
    pub const TYPE_RUNTIME_ARRAY: u32 = 29;
    pub const TYPE_STRUCT: u32 = 30;
    pub const TYPE_POINTER: u32 = 32;
    pub const CONSTANT: u32 = 43;
    pub const VARIABLE: u32 = 59;
    pub const LOAD: u32 = 61;
    pub const COPY_MEMORY: u32 = 63;
    pub const ACCESS_CHAIN: u32 = 65;
    pub const IN_BOUNDS_ACCESS_CHAIN: u32 = 66;
    pub const DECORATE: u32 = 71;
    pub const MEMBER_DECORATE: u32 = 72;
}

pub(crate) mod decoration {
    pub const BLOCK: u32 = 2;
    pub const ROW_MAJOR: u32 = 4;
    pub const ARRAY_STRIDE: u32 = 6;
    pub const MATRIX_STRIDE: u32 = 7;
    pub const BUILT_IN: u32 = 11;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const OFFSET: u32 = 35;
}

pub(crate) mod storage {
    pub const UNIFORM_CONSTANT: u32 = 0;
    pub const INPUT: u32 = 1;
    pub const UNIFORM: u32 = 2;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpirvError {
    #[error("bytecode length {0} is not a multiple of 4")]
    UnalignedLength(usize),

    #[error("bytecode has {0} words, too short for a SPIR-V header")]
    Truncated(usize),

    #[error("bad SPIR-V magic number {0:#010x}")]
    BadMagic(u32),

    #[error("instruction at word {offset} has invalid word count {count}")]
    BadInstruction { offset: usize, count: usize },

    #[error("instruction at word {offset} (opcode {opcode}) is missing operands")]
    MissingOperands { offset: usize, opcode: u32 },

    #[error("size of type %{0} does not fit in 32 bits")]
    SizeOverflow(u32),

    #[error("type %{0} nests too deeply or refers to itself")]
    TypeTooDeep(u32),
}

/// Array and struct nesting accepted before a type is rejected as cyclic.
pub const MAX_TYPE_DEPTH: usize = 64;

/// Converts a `.spv` file's bytes into words, honouring either byte order.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, SpirvError> {
    if bytes.len() % 4 != 0 {
        return Err(SpirvError::UnalignedLength(bytes.len()));
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    match words.first() {
        None => Err(SpirvError::Truncated(0)),
        Some(&MAGIC) => Ok(words),
        Some(&w) if w.swap_bytes() == MAGIC => {
            for w in &mut words {
                *w = w.swap_bytes();
            }
            Ok(words)
        }
        Some(&w) => Err(SpirvError::BadMagic(w)),
    }
}

/// An active member range of a uniform buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRange {
    pub index: u32,
    pub name: String,
    pub offset: u32,
    pub range: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBufferResource {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    /// In first-reference order
    pub active_ranges: Vec<BufferRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledImageResource {
    pub name: String,
    pub set: u32,
    pub binding: u32,
}

/// Everything reflection reports about one shader stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderResources {
    /// In declaration order
    pub uniform_buffers: Vec<UniformBufferResource>,
    pub sampled_images: Vec<SampledImageResource>,
    pub stage_inputs: Vec<String>,
}

/// Extracts resource metadata from compiled bytecode.
pub trait BytecodeIntrospector: Send + Sync {
    fn introspect(&self, bytecode: &[u32]) -> Result<ShaderResources, SpirvError>;
}

/// The built-in SPIR-V introspector.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpirvIntrospector;

impl BytecodeIntrospector for SpirvIntrospector {
    fn introspect(&self, bytecode: &[u32]) -> Result<ShaderResources, SpirvError> {
        Module::parse(bytecode)?.resources()
    }
}

#[derive(Debug, Clone)]
enum Type {
    Bool,
    Int { width: u32 },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, columns: u32 },
    Image,
    Sampler,
    SampledImage,
    Array { element: u32, length: u32 },
    RuntimeArray,
    Struct { members: Vec<u32> },
    Pointer { pointee: u32 },
}

#[derive(Debug, Default)]
struct Decorations {
    block: bool,
    built_in: bool,
    row_major: bool,
    set: Option<u32>,
    binding: Option<u32>,
    array_stride: Option<u32>,
    matrix_stride: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug)]
struct Variable {
    id: u32,
    pointer_type: u32,
    storage: u32,
}

#[derive(Debug, Default)]
enum Access {
    #[default]
    None,
    Members(Vec<u32>),
    Whole,
}

impl Access {
    fn touch_member(&mut self, member: u32) {
        match self {
            Access::Whole => {}
            Access::None => *self = Access::Members(vec![member]),
            Access::Members(members) => {
                if !members.contains(&member) {
                    members.push(member);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Module {
    names: HashMap<u32, String>,
    member_names: HashMap<(u32, u32), String>,
    decorations: HashMap<u32, Decorations>,
    member_decorations: HashMap<(u32, u32), Decorations>,
    types: HashMap<u32, Type>,
    constants: HashMap<u32, u32>,
    variables: Vec<Variable>,
    access: HashMap<u32, Access>,
}

fn operands_at(
    words: &[u32],
    offset: usize,
    opcode: u32,
    min: usize,
) -> Result<&[u32], SpirvError> {
    if words.len() < min {
        return Err(SpirvError::MissingOperands { offset, opcode });
    }
    Ok(words)
}

/// Decodes a nul-terminated literal string packed into words.
fn literal_string(words: &[u32]) -> String {
    let mut bytes = Vec::new();
    'outer: for word in words {
        for b in word.to_le_bytes() {
            if b == 0 {
                break 'outer;
            }
            bytes.push(b);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

impl Module {
    fn parse(words: &[u32]) -> Result<Self, SpirvError> {
        if words.len() < HEADER_WORDS {
            return Err(SpirvError::Truncated(words.len()));
        }
        if words[0] != MAGIC {
            return Err(SpirvError::BadMagic(words[0]));
        }

        let mut module = Module::default();
        let mut offset = HEADER_WORDS;

        while offset < words.len() {
            let count = (words[offset] >> 16) as usize;
            let opcode = words[offset] & 0xffff;

            if count == 0 || offset + count > words.len() {
                return Err(SpirvError::BadInstruction { offset, count });
            }

            let operands = &words[offset + 1..offset + count];
            module.decode(offset, opcode, operands)?;
            offset += count;
        }

        Ok(module)
    }

    fn decode(&mut self, offset: usize, opcode: u32, operands: &[u32]) -> Result<(), SpirvError> {
        let need = move |min: usize| operands_at(operands, offset, opcode, min);

        match opcode {
            op::NAME => {
                let o = need(1)?;
                self.names.insert(o[0], literal_string(&o[1..]));
            }
            op::MEMBER_NAME => {
                let o = need(2)?;
                self.member_names
                    .insert((o[0], o[1]), literal_string(&o[2..]));
            }
            op::DECORATE => {
                let o = need(2)?;
                let entry = self.decorations.entry(o[0]).or_default();
                apply_decoration(entry, o[1], &o[2..]);
            }
            op::MEMBER_DECORATE => {
                let o = need(3)?;
                let entry = self.member_decorations.entry((o[0], o[1])).or_default();
                apply_decoration(entry, o[2], &o[3..]);
            }
            op::TYPE_BOOL => {
                let o = need(1)?;
                self.types.insert(o[0], Type::Bool);
            }
            op::TYPE_INT => {
                let o = need(2)?;
                self.types.insert(o[0], Type::Int { width: o[1] });
            }
            op::TYPE_FLOAT => {
                let o = need(2)?;
                self.types.insert(o[0], Type::Float { width: o[1] });
            }
            op::TYPE_VECTOR => {
                let o = need(3)?;
                self.types.insert(
                    o[0],
                    Type::Vector {
                        component: o[1],
                        count: o[2],
                    },
                );
            }
            op::TYPE_MATRIX => {
                let o = need(3)?;
                self.types.insert(
                    o[0],
                    Type::Matrix {
                        column: o[1],
                        columns: o[2],
                    },
                );
            }
            op::TYPE_IMAGE => {
                let o = need(1)?;
                self.types.insert(o[0], Type::Image);
            }
            op::TYPE_SAMPLER => {
                let o = need(1)?;
                self.types.insert(o[0], Type::Sampler);
            }
            op::TYPE_SAMPLED_IMAGE => {
                let o = need(2)?;
                self.types.insert(o[0], Type::SampledImage);
            }
            op::TYPE_ARRAY => {
                let o = need(3)?;
                // array lengths are constants declared before the array type
                let length = self.constants.get(&o[2]).copied().unwrap_or(0);
                self.types.insert(
                    o[0],
                    Type::Array {
                        element: o[1],
                        length,
                    },
                );
            }
            op::TYPE_RUNTIME_ARRAY => {
                let o = need(2)?;
                self.types.insert(o[0], Type::RuntimeArray);
            }
            op::TYPE_STRUCT => {
                let o = need(1)?;
                self.types.insert(
                    o[0],
                    Type::Struct {
                        members: o[1..].to_vec(),
                    },
                );
            }
            op::TYPE_POINTER => {
                let o = need(3)?;
                self.types.insert(o[0], Type::Pointer { pointee: o[2] });
            }
            op::CONSTANT => {
                let o = need(3)?;
                self.constants.insert(o[1], o[2]);
            }
            op::VARIABLE => {
                let o = need(3)?;
                self.variables.push(Variable {
                    id: o[1],
                    pointer_type: o[0],
                    storage: o[2],
                });
            }
            op::LOAD => {
                let o = need(3)?;
                if self.is_variable(o[2]) {
                    self.access.insert(o[2], Access::Whole);
                }
            }
            op::COPY_MEMORY => {
                let o = need(2)?;
                if self.is_variable(o[1]) {
                    self.access.insert(o[1], Access::Whole);
                }
            }
            op::ACCESS_CHAIN | op::IN_BOUNDS_ACCESS_CHAIN => {
                let o = need(3)?;
                let base = o[2];
                if self.is_variable(base) {
                    let first_index = o.get(3).and_then(|id| self.constants.get(id)).copied();
                    let access = self.access.entry(base).or_default();
                    match first_index {
                        Some(member) => access.touch_member(member),
                        None => *access = Access::Whole,
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn is_variable(&self, id: u32) -> bool {
        self.variables.iter().any(|v| v.id == id)
    }

    fn pointee(&self, pointer_type: u32) -> Option<u32> {
        match self.types.get(&pointer_type)? {
            Type::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// Strips array wrappers off `type_id`.
    fn base_type(&self, type_id: u32) -> Result<u32, SpirvError> {
        let mut current = type_id;
        for _ in 0..=MAX_TYPE_DEPTH {
            match self.types.get(&current) {
                Some(Type::Array { element, .. }) => current = *element,
                _ => return Ok(current),
            }
        }
        Err(SpirvError::TypeTooDeep(type_id))
    }

    fn name_of(&self, id: u32) -> Option<&str> {
        self.names
            .get(&id)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }

    fn decoration(&self, id: u32) -> Option<&Decorations> {
        self.decorations.get(&id)
    }

    fn member_decoration(&self, struct_id: u32, member: u32) -> Option<&Decorations> {
        self.member_decorations.get(&(struct_id, member))
    }

    fn scalar_size(&self, type_id: u32) -> u32 {
        match self.types.get(&type_id) {
            Some(Type::Bool) => 4,
            Some(Type::Int { width }) | Some(Type::Float { width }) => width / 8,
            _ => 0,
        }
    }

    fn vector_info(&self, type_id: u32) -> (u32, u32) {
        match self.types.get(&type_id) {
            Some(Type::Vector { component, count }) => (self.scalar_size(*component), *count),
            _ => (self.scalar_size(type_id), 1),
        }
    }

    /// Declared size of a type as laid out in a buffer, in bytes.
    ///
    /// `member` names the struct member being sized, which carries matrix
    /// stride and majorness decorations.
    fn declared_size(&self, type_id: u32, member: Option<(u32, u32)>) -> Result<u32, SpirvError> {
        self.sized(type_id, member, 0)
    }

    fn sized(&self, type_id: u32, member: Option<(u32, u32)>, depth: usize) -> Result<u32, SpirvError> {
        if depth > MAX_TYPE_DEPTH {
            return Err(SpirvError::TypeTooDeep(type_id));
        }
        let Some(ty) = self.types.get(&type_id) else {
            return Ok(0);
        };
        let overflow = || SpirvError::SizeOverflow(type_id);

        match ty {
            Type::Bool | Type::Int { .. } | Type::Float { .. } => Ok(self.scalar_size(type_id)),
            Type::Vector { component, count } => {
                self.scalar_size(*component).checked_mul(*count).ok_or_else(overflow)
            }
            Type::Matrix { column, columns } => {
                let (scalar, rows) = self.vector_info(*column);
                let decorations = member.and_then(|(s, m)| self.member_decoration(s, m));
                let size = match decorations.and_then(|d| d.matrix_stride.map(|s| (s, d.row_major))) {
                    Some((stride, true)) => stride.checked_mul(rows),
                    Some((stride, false)) => stride.checked_mul(*columns),
                    None => scalar.checked_mul(rows).and_then(|s| s.checked_mul(*columns)),
                };
                size.ok_or_else(overflow)
            }
            Type::Array { element, length } => {
                let stride = match self.decoration(type_id).and_then(|d| d.array_stride) {
                    Some(stride) => stride,
                    None => self.sized(*element, member, depth + 1)?,
                };
                stride.checked_mul(*length).ok_or_else(overflow)
            }
            Type::Struct { members } => match members.len().checked_sub(1) {
                Some(last) => {
                    let last = last as u32;
                    let offset = self
                        .member_decoration(type_id, last)
                        .and_then(|d| d.offset)
                        .unwrap_or(0);
                    let size = self.sized(members[last as usize], Some((type_id, last)), depth + 1)?;
                    offset.checked_add(size).ok_or_else(overflow)
                }
                None => Ok(0),
            },
            Type::RuntimeArray
            | Type::Pointer { .. }
            | Type::Image
            | Type::Sampler
            | Type::SampledImage => Ok(0),
        }
    }

    fn member_range(
        &self,
        struct_id: u32,
        members: &[u32],
        index: u32,
    ) -> Result<Option<BufferRange>, SpirvError> {
        let Some(&member_type) = members.get(index as usize) else {
            return Ok(None);
        };
        let offset = self
            .member_decoration(struct_id, index)
            .and_then(|d| d.offset)
            .unwrap_or(0);

        Ok(Some(BufferRange {
            index,
            name: self
                .member_names
                .get(&(struct_id, index))
                .cloned()
                .unwrap_or_default(),
            offset,
            range: self.declared_size(member_type, Some((struct_id, index)))?,
        }))
    }

    fn uniform_buffer(&self, var: &Variable) -> Result<Option<UniformBufferResource>, SpirvError> {
        let Some(pointee) = self.pointee(var.pointer_type) else {
            return Ok(None);
        };
        let block = self.base_type(pointee)?;
        let Some(Type::Struct { members }) = self.types.get(&block) else {
            return Ok(None);
        };
        if !self.decoration(block).map(|d| d.block).unwrap_or(false) {
            return Ok(None);
        }

        let active: Vec<u32> = match self.access.get(&var.id) {
            Some(Access::Whole) => (0..members.len() as u32).collect(),
            Some(Access::Members(indices)) => indices.clone(),
            Some(Access::None) | None => Vec::new(),
        };

        let mut active_ranges = Vec::with_capacity(active.len());
        for index in active {
            if let Some(range) = self.member_range(block, members, index)? {
                active_ranges.push(range);
            }
        }

        let decorations = self.decoration(var.id);
        Ok(Some(UniformBufferResource {
            name: self
                .name_of(block)
                .or_else(|| self.name_of(var.id))
                .unwrap_or_default()
                .to_string(),
            set: decorations.and_then(|d| d.set).unwrap_or(0),
            binding: decorations.and_then(|d| d.binding).unwrap_or(0),
            active_ranges,
        }))
    }

    fn sampled_image(&self, var: &Variable) -> Result<Option<SampledImageResource>, SpirvError> {
        let Some(pointee) = self.pointee(var.pointer_type) else {
            return Ok(None);
        };
        let base = self.base_type(pointee)?;
        if !matches!(self.types.get(&base), Some(Type::SampledImage)) {
            return Ok(None);
        }

        let decorations = self.decoration(var.id);
        Ok(Some(SampledImageResource {
            name: self.name_of(var.id).unwrap_or_default().to_string(),
            set: decorations.and_then(|d| d.set).unwrap_or(0),
            binding: decorations.and_then(|d| d.binding).unwrap_or(0),
        }))
    }

    fn is_builtin(&self, var: &Variable) -> Result<bool, SpirvError> {
        if self.decoration(var.id).map(|d| d.built_in).unwrap_or(false) {
            return Ok(true);
        }
        // gl_PerVertex-style blocks carry BuiltIn on their members
        let Some(pointee) = self.pointee(var.pointer_type) else {
            return Ok(false);
        };
        let block = self.base_type(pointee)?;
        Ok(match self.types.get(&block) {
            Some(Type::Struct { members }) => (0..members.len() as u32).any(|m| {
                self.member_decoration(block, m)
                    .map(|d| d.built_in)
                    .unwrap_or(false)
            }),
            _ => false,
        })
    }

    fn resources(&self) -> Result<ShaderResources, SpirvError> {
        let mut resources = ShaderResources::default();

        for var in &self.variables {
            match var.storage {
                storage::UNIFORM => {
                    if let Some(ubo) = self.uniform_buffer(var)? {
                        resources.uniform_buffers.push(ubo);
                    }
                }
                storage::UNIFORM_CONSTANT => {
                    if let Some(image) = self.sampled_image(var)? {
                        resources.sampled_images.push(image);
                    }
                }
                storage::INPUT if !self.is_builtin(var)? => {
                    if let Some(name) = self.name_of(var.id) {
                        resources.stage_inputs.push(name.to_string());
                    }
                }
                _ => {}
            }
        }

        Ok(resources)
    }
}

fn apply_decoration(entry: &mut Decorations, decoration: u32, literals: &[u32]) {
    let first = literals.first().copied();
    match decoration {
        decoration::BLOCK => entry.block = true,
        decoration::ROW_MAJOR => entry.row_major = true,
        decoration::BUILT_IN => entry.built_in = true,
        decoration::ARRAY_STRIDE => entry.array_stride = first,
        decoration::MATRIX_STRIDE => entry.matrix_stride = first,
        decoration::BINDING => entry.binding = first,
        decoration::DESCRIPTOR_SET => entry.set = first,
        decoration::OFFSET => entry.offset = first,
        _ => {}
    }
}
