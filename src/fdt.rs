//! Flattened device tree builder. Not a parser: the crate never loads a
//! DTB itself, it only emits one for a guest kernel to consume when
//! `Config::dtb_path` is absent. Follows the standard flattened-devicetree
//! binary layout: header, then struct block, then strings block.

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_END: u32 = 0x9;

/// A property value. Cells are big-endian 32-bit words per the
/// devicetree spec; strings are NUL-terminated.
#[derive(Debug, Clone)]
pub enum FdtValue {
    Empty,
    U32(u32),
    U64(u64),
    String(String),
    Cells(Vec<u32>),
    Bytes(Vec<u8>),
}

impl FdtValue {
    fn encode(&self) -> Vec<u8> {
        match self {
            FdtValue::Empty => Vec::new(),
            FdtValue::U32(v) => v.to_be_bytes().to_vec(),
            FdtValue::U64(v) => v.to_be_bytes().to_vec(),
            FdtValue::String(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            FdtValue::Cells(cells) => cells.iter().flat_map(|c| c.to_be_bytes()).collect(),
            FdtValue::Bytes(b) => b.clone(),
        }
    }
}

/// One node in the tree under construction. Device-contributed nodes
/// (`Device::fdt_node`) are spliced in as children of `soc` by name.
#[derive(Debug, Clone)]
pub struct FdtNode {
    pub name: String,
    pub props: Vec<(String, FdtValue)>,
    pub children: Vec<FdtNode>,
}

impl FdtNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), props: Vec::new(), children: Vec::new() }
    }

    pub fn prop(mut self, name: impl Into<String>, value: FdtValue) -> Self {
        self.props.push((name.into(), value));
        self
    }

    pub fn child(mut self, node: FdtNode) -> Self {
        self.children.push(node);
        self
    }

    fn write_struct(&self, struct_block: &mut Vec<u8>, strings: &mut StringsBlock) {
        struct_block.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        struct_block.extend_from_slice(self.name.as_bytes());
        struct_block.push(0);
        pad4(struct_block);
        for (name, value) in &self.props {
            let encoded = value.encode();
            let offset = strings.intern(name);
            struct_block.extend_from_slice(&FDT_PROP.to_be_bytes());
            struct_block.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            struct_block.extend_from_slice(&offset.to_be_bytes());
            struct_block.extend_from_slice(&encoded);
            pad4(struct_block);
        }
        for child in &self.children {
            child.write_struct(struct_block, strings);
        }
        struct_block.extend_from_slice(&FDT_END_NODE.to_be_bytes());
    }
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

struct StringsBlock {
    data: Vec<u8>,
}

impl StringsBlock {
    fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// No de-duplication: property names repeat rarely enough across a
    /// machine-sized tree that a lookup table isn't worth the complexity.
    fn intern(&mut self, name: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        offset
    }
}

/// Top-level builder. `Machine::build_fdt` assembles one of these from
/// RAM, hart, and PLIC/CLINT metadata, then serializes it to a blob the
/// guest bootloader can be pointed at via `a1`.
pub struct Fdt {
    root: FdtNode,
}

impl Fdt {
    pub fn new(root: FdtNode) -> Self {
        Self { root }
    }

    pub fn to_blob(&self) -> Vec<u8> {
        let mut struct_block = Vec::new();
        let mut strings = StringsBlock::new();
        self.root.write_struct(&mut struct_block, &mut strings);
        struct_block.extend_from_slice(&FDT_END.to_be_bytes());

        let header_size = 40u32;
        let struct_offset = header_size;
        let strings_offset = struct_offset + struct_block.len() as u32;
        let total_size = strings_offset + strings.data.len() as u32;

        let mut blob = Vec::with_capacity(total_size as usize);
        blob.extend_from_slice(&FDT_MAGIC.to_be_bytes());
        blob.extend_from_slice(&total_size.to_be_bytes());
        blob.extend_from_slice(&struct_offset.to_be_bytes());
        blob.extend_from_slice(&strings_offset.to_be_bytes());
        blob.extend_from_slice(&header_size.to_be_bytes()); // off_mem_rsvmap (empty, right after header)
        blob.extend_from_slice(&FDT_VERSION.to_be_bytes());
        blob.extend_from_slice(&FDT_LAST_COMP_VERSION.to_be_bytes());
        blob.extend_from_slice(&0u32.to_be_bytes()); // boot_cpuid_phys
        blob.extend_from_slice(&(strings.data.len() as u32).to_be_bytes());
        blob.extend_from_slice(&(struct_block.len() as u32).to_be_bytes());
        blob.extend_from_slice(&struct_block);
        blob.extend_from_slice(&strings.data);
        blob
    }
}
