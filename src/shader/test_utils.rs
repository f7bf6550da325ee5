//! Helpers for building synthetic SPIR-V modules in tests.
//!
//! The modules are not valid for a driver (no entry point, no functions), but
//! they carry exactly the declarations the introspector reads.

use super::spirv::{decoration, op, storage, MAGIC};

const DECORATION_LOCATION: u32 = 30;
const BUILT_IN_FRAG_COORD: u32 = 15;

pub struct SpirvBuilder {
    body: Vec<u32>,
    next_id: u32,
}

impl SpirvBuilder {
    pub fn new() -> Self {
        Self {
            body: Vec::new(),
            next_id: 1,
        }
    }

    pub fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Appends a raw instruction; ids in `operands` are not checked.
    pub fn inst(&mut self, opcode: u32, operands: &[u32]) {
        let count = u32::try_from(operands.len() + 1).expect("instruction too long");
        self.body.push((count << 16) | opcode);
        self.body.extend_from_slice(operands);
    }

    fn string_words(s: &str) -> Vec<u32> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn name(&mut self, target: u32, name: &str) {
        let mut operands = vec![target];
        operands.extend(Self::string_words(name));
        self.inst(op::NAME, &operands);
    }

    pub fn member_name(&mut self, ty: u32, member: u32, name: &str) {
        let mut operands = vec![ty, member];
        operands.extend(Self::string_words(name));
        self.inst(op::MEMBER_NAME, &operands);
    }

    pub fn decorate(&mut self, target: u32, decoration: u32, literals: &[u32]) {
        let mut operands = vec![target, decoration];
        operands.extend_from_slice(literals);
        self.inst(op::DECORATE, &operands);
    }

    pub fn member_decorate(&mut self, ty: u32, member: u32, decoration: u32, literals: &[u32]) {
        let mut operands = vec![ty, member, decoration];
        operands.extend_from_slice(literals);
        self.inst(op::MEMBER_DECORATE, &operands);
    }

    pub fn type_float(&mut self, width: u32) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_FLOAT, &[id, width]);
        id
    }

    pub fn type_uint(&mut self) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_INT, &[id, 32, 0]);
        id
    }

    pub fn type_vector(&mut self, component: u32, count: u32) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_VECTOR, &[id, component, count]);
        id
    }

    pub fn type_matrix(&mut self, column: u32, columns: u32) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_MATRIX, &[id, column, columns]);
        id
    }

    pub fn type_image_2d(&mut self, sampled_type: u32) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_IMAGE, &[id, sampled_type, 1, 0, 0, 0, 1, 0]);
        id
    }

    pub fn type_sampled_image(&mut self, image: u32) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_SAMPLED_IMAGE, &[id, image]);
        id
    }

    pub fn type_array(&mut self, element: u32, length: u32) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_ARRAY, &[id, element, length]);
        id
    }

    pub fn type_struct(&mut self, members: &[u32]) -> u32 {
        let id = self.id();
        let mut operands = vec![id];
        operands.extend_from_slice(members);
        self.inst(op::TYPE_STRUCT, &operands);
        id
    }

    pub fn type_pointer(&mut self, storage: u32, pointee: u32) -> u32 {
        let id = self.id();
        self.inst(op::TYPE_POINTER, &[id, storage, pointee]);
        id
    }

    pub fn constant(&mut self, ty: u32, value: u32) -> u32 {
        let id = self.id();
        self.inst(op::CONSTANT, &[ty, id, value]);
        id
    }

    pub fn variable(&mut self, pointer_type: u32, storage: u32) -> u32 {
        let id = self.id();
        self.inst(op::VARIABLE, &[pointer_type, id, storage]);
        id
    }

    pub fn access_chain(&mut self, result_type: u32, base: u32, indices: &[u32]) -> u32 {
        let id = self.id();
        let mut operands = vec![result_type, id, base];
        operands.extend_from_slice(indices);
        self.inst(op::ACCESS_CHAIN, &operands);
        id
    }

    pub fn load(&mut self, result_type: u32, pointer: u32) -> u32 {
        let id = self.id();
        self.inst(op::LOAD, &[result_type, id, pointer]);
        id
    }

    fn set_and_binding(&mut self, var: u32, set: u32, binding: u32) {
        self.decorate(var, decoration::DESCRIPTOR_SET, &[set]);
        self.decorate(var, decoration::BINDING, &[binding]);
    }

    pub fn sampled_image(&mut self, name: &str, set: u32, binding: u32) -> u32 {
        let float = self.type_float(32);
        let image = self.type_image_2d(float);
        let sampled = self.type_sampled_image(image);
        let pointer = self.type_pointer(storage::UNIFORM_CONSTANT, sampled);
        let var = self.variable(pointer, storage::UNIFORM_CONSTANT);
        self.name(var, name);
        self.set_and_binding(var, set, binding);
        var
    }

    pub fn sampled_image_array(&mut self, name: &str, set: u32, binding: u32, count: u32) -> u32 {
        let float = self.type_float(32);
        let uint = self.type_uint();
        let image = self.type_image_2d(float);
        let sampled = self.type_sampled_image(image);
        let length = self.constant(uint, count);
        let array = self.type_array(sampled, length);
        let pointer = self.type_pointer(storage::UNIFORM_CONSTANT, array);
        let var = self.variable(pointer, storage::UNIFORM_CONSTANT);
        self.name(var, name);
        self.set_and_binding(var, set, binding);
        var
    }

    pub fn input_variable(&mut self, name: &str, built_in: bool) -> u32 {
        let float = self.type_float(32);
        let vec4 = self.type_vector(float, 4);
        let pointer = self.type_pointer(storage::INPUT, vec4);
        let var = self.variable(pointer, storage::INPUT);
        self.name(var, name);
        if built_in {
            self.decorate(var, decoration::BUILT_IN, &[BUILT_IN_FRAG_COORD]);
        } else {
            self.decorate(var, DECORATION_LOCATION, &[0]);
        }
        var
    }

    pub fn build(self) -> Vec<u32> {
        let mut words = vec![MAGIC, 0x0001_0000, 0, self.next_id, 0];
        words.extend(self.body);
        words
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MemberKind {
    Float,
    Vec3,
    Vec4,
    Mat4,
    Mat4x3RowMajor,
    Vec4Array(u32),
}

impl MemberKind {
    /// std140 (alignment, size)
    fn layout(self) -> (u32, u32) {
        match self {
            MemberKind::Float => (4, 4),
            MemberKind::Vec3 => (16, 12),
            MemberKind::Vec4 => (16, 16),
            MemberKind::Mat4 => (16, 64),
            MemberKind::Mat4x3RowMajor => (16, 48),
            MemberKind::Vec4Array(n) => (16, 16 * n),
        }
    }
}

/// A uniform block declaration plus the accesses a shader body makes to it.
pub struct UniformBlock {
    name: String,
    variable_name: String,
    set: u32,
    binding: u32,
    members: Vec<(String, MemberKind)>,
    touched: Vec<u32>,
    whole: bool,
}

impl UniformBlock {
    pub fn new(name: &str, set: u32, binding: u32) -> Self {
        Self {
            name: name.to_string(),
            variable_name: String::new(),
            set,
            binding,
            members: Vec::new(),
            touched: Vec::new(),
            whole: false,
        }
    }

    pub fn variable_name(mut self, name: &str) -> Self {
        self.variable_name = name.to_string();
        self
    }

    pub fn member(mut self, name: &str, kind: MemberKind) -> Self {
        self.members.push((name.to_string(), kind));
        self
    }

    /// Access chains into the listed members, in order.
    pub fn touch(mut self, members: &[u32]) -> Self {
        self.touched.extend_from_slice(members);
        self
    }

    pub fn load_whole(mut self) -> Self {
        self.whole = true;
        self
    }

    pub fn emit(self, b: &mut SpirvBuilder) -> u32 {
        let float = b.type_float(32);
        let uint = b.type_uint();
        let vec3 = b.type_vector(float, 3);
        let vec4 = b.type_vector(float, 4);

        let member_types: Vec<u32> = self
            .members
            .iter()
            .map(|(_, kind)| match *kind {
                MemberKind::Float => float,
                MemberKind::Vec3 => vec3,
                MemberKind::Vec4 => vec4,
                MemberKind::Mat4 => b.type_matrix(vec4, 4),
                MemberKind::Mat4x3RowMajor => b.type_matrix(vec3, 4),
                MemberKind::Vec4Array(n) => {
                    let length = b.constant(uint, n);
                    let array = b.type_array(vec4, length);
                    b.decorate(array, decoration::ARRAY_STRIDE, &[16]);
                    array
                }
            })
            .collect();

        let block = b.type_struct(&member_types);
        if !self.name.is_empty() {
            b.name(block, &self.name);
        }
        b.decorate(block, decoration::BLOCK, &[]);

        let mut offset: u32 = 0;
        for (i, (name, kind)) in self.members.iter().enumerate() {
            let i = i as u32;
            let (align, size) = kind.layout();
            offset = offset.div_ceil(align) * align;

            b.member_name(block, i, name);
            b.member_decorate(block, i, decoration::OFFSET, &[offset]);
            match kind {
                MemberKind::Mat4 => {
                    b.member_decorate(block, i, decoration::MATRIX_STRIDE, &[16]);
                }
                MemberKind::Mat4x3RowMajor => {
                    b.member_decorate(block, i, decoration::ROW_MAJOR, &[]);
                    b.member_decorate(block, i, decoration::MATRIX_STRIDE, &[16]);
                }
                _ => {}
            }
            offset += size;
        }

        let pointer = b.type_pointer(storage::UNIFORM, block);
        let var = b.variable(pointer, storage::UNIFORM);
        b.set_and_binding(var, self.set, self.binding);
        if !self.variable_name.is_empty() {
            b.name(var, &self.variable_name);
        }

        for &member in &self.touched {
            let index = b.constant(uint, member);
            let member_pointer = b.type_pointer(storage::UNIFORM, member_types[member as usize]);
            b.access_chain(member_pointer, var, &[index]);
        }
        if self.whole {
            b.load(block, var);
        }

        var
    }
}

/// A stage declaring `Matrices { mat4 model; mat4 view; mat4 proj; }` at set 0,
/// binding 0, referencing the members in `touch_order`.
pub fn matrices_module(touch_order: &[u32]) -> Vec<u32> {
    let mut b = SpirvBuilder::new();
    UniformBlock::new("Matrices", 0, 0)
        .variable_name("ubo")
        .member("model", MemberKind::Mat4)
        .member("view", MemberKind::Mat4)
        .member("proj", MemberKind::Mat4)
        .touch(touch_order)
        .emit(&mut b);
    b.build()
}

/// Little-endian bytes of `words`, as found in a `.spv` file.
pub fn spirv_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
