use core::fmt;
use core::ops::Range;

use crate::fdt::{FdtHeader, FdtNodeType, ReservedMemoryEntry};
use utils::{
    endian::{BigEndian32, BigEndian64, EndianData},
    num::AlignableTo,
};

/// Largest acceptable value for a `#<name>-cells` property.
pub const MAX_CELLS: u32 = 4;
/// `#address-cells` assumed when a node context does not declare one.
pub const ADDRESS_CELLS_DEFAULT: u32 = 2;
/// `#size-cells` assumed when a node context does not declare one.
pub const SIZE_CELLS_DEFAULT: u32 = 1;

const HEADER_LEN: usize = 40;
const RSVMAP_ENTRY_LEN: usize = 16;

/// Errors reported while walking the blob structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtError {
    /// A token other than the expected one was found at `cursor`.
    InvalidNodeType { node_type: u32, cursor: usize },
    /// The header magic field does not identify an FDT blob.
    InvalidMagic { magic: u32 },
    /// The blob's version window does not overlap the supported one.
    IncompatibleVersion { version: u32 },
    /// The provided slice is shorter than the header claims.
    TruncatedBlob { totalsize: u32 },
    /// A read would run past the end of its block.
    OutOfBounds { cursor: usize },
    /// A name is not valid UTF-8 or is missing its NUL terminator.
    InvalidString { cursor: usize },
    /// A `#<name>-cells` property is not a single cell in `0..=4`.
    InvalidCellCount { count: u32 },
}

impl fmt::Display for FdtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdtError::InvalidNodeType { node_type, cursor } => {
                write!(f, "unexpected structure token {node_type:#x} at {cursor:#x}")
            }
            FdtError::InvalidMagic { magic } => write!(f, "invalid FDT magic {magic:#x}"),
            FdtError::IncompatibleVersion { version } => {
                write!(f, "incompatible FDT version {version}")
            }
            FdtError::TruncatedBlob { totalsize } => {
                write!(f, "blob shorter than declared total size {totalsize}")
            }
            FdtError::OutOfBounds { cursor } => write!(f, "read past block end at {cursor:#x}"),
            FdtError::InvalidString { cursor } => write!(f, "invalid string at {cursor:#x}"),
            FdtError::InvalidCellCount { count } => write!(f, "invalid cell count {count}"),
        }
    }
}

/// A raw property entry: resolved name plus the unparsed big-endian payload.
///
/// Both fields borrow from the blob.
#[derive(Debug, Clone, Copy)]
pub struct RawProperty<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Read-only, offset-addressed view of an FDT blob.
///
/// Node handles are byte offsets of `FDT_BEGIN_NODE` tokens inside the
/// structure block, in the manner of libfdt's node offsets. Every access is
/// bounds-checked against the block the data lives in; node names and
/// property payloads are zero-copy borrows of the blob.
#[derive(Clone, Copy)]
pub struct Fdt<'a> {
    blob: &'a [u8],
    header: FdtHeader,
}

impl<'a> Fdt<'a> {
    /// Expected FDT magic number (0xd00dfeed).
    pub const FDT_MAGIC: u32 = 0xd00dfeed;
    /// The FDT version this walker targets.
    pub const FDT_VERSION: u32 = 17;
    /// The last compatible FDT version accepted by this walker.
    pub const LAST_COMP_VERSION: u32 = 16;

    /// Create a walker over `blob`, validating the header.
    ///
    /// Checks the magic number, the version window and that every block the
    /// header names fits inside the declared total size.
    pub fn new(blob: &'a [u8]) -> Result<Fdt<'a>, FdtError> {
        let header = parse_header(blob)?;

        // 1. Check the magic number
        if header.magic != Self::FDT_MAGIC {
            return Err(FdtError::InvalidMagic { magic: header.magic });
        }

        // 2. Check the fdt version. We use version 17, and the last compatible version is 16
        if header.version < Self::LAST_COMP_VERSION
            || header.last_comp_version > Self::FDT_VERSION
        {
            return Err(FdtError::IncompatibleVersion { version: header.version });
        }

        // 3. Check that the declared blocks fit the provided slice.
        let total = header.totalsize as usize;
        if total > blob.len() {
            return Err(FdtError::TruncatedBlob { totalsize: header.totalsize });
        }
        let struct_end = header.off_dt_struct as usize + header.size_dt_struct as usize;
        let strings_end = header.off_dt_strings as usize + header.size_dt_strings as usize;
        if struct_end > total || strings_end > total || header.off_mem_rsvmap as usize > total {
            return Err(FdtError::OutOfBounds { cursor: total });
        }

        Ok(Fdt { blob, header })
    }

    /// Return the decoded FDT header.
    pub fn header(&self) -> &FdtHeader {
        &self.header
    }

    fn struct_range(&self) -> Range<usize> {
        let start = self.header.off_dt_struct as usize;
        start..start + self.header.size_dt_struct as usize
    }

    fn strings_range(&self) -> Range<usize> {
        let start = self.header.off_dt_strings as usize;
        start..start + self.header.size_dt_strings as usize
    }

    fn cursor_at(&self, pos: usize) -> Cursor<'a, '_> {
        Cursor { fdt: self, pos, end: self.struct_range().end }
    }

    /// Offset of the root node's `FDT_BEGIN_NODE` token.
    pub fn root_offset(&self) -> Result<usize, FdtError> {
        let mut cursor = self.cursor_at(self.struct_range().start);
        cursor.skip_padding()?;
        let token = cursor.peek()?;
        if token != FdtNodeType::FDT_BEGIN_NODE.bits {
            return Err(FdtError::InvalidNodeType { node_type: token, cursor: cursor.pos });
        }
        Ok(cursor.pos)
    }

    /// Full name of the node at `node_off` (zero-copy).
    pub fn node_name(&self, node_off: usize) -> Result<&'a str, FdtError> {
        let mut cursor = self.cursor_at(node_off);
        cursor.read_and_check(FdtNodeType::FDT_BEGIN_NODE)?;
        cursor.read_name()
    }

    /// Enumerate the properties of the node at `node_off`, in blob order.
    pub fn properties(&self, node_off: usize) -> Result<PropertyIter<'a, '_>, FdtError> {
        let mut cursor = self.cursor_at(node_off);
        cursor.enter_node()?;
        Ok(PropertyIter { cursor, done: false })
    }

    /// Enumerate the direct subnode offsets of the node at `node_off`, in blob order.
    pub fn subnodes(&self, node_off: usize) -> Result<SubnodeIter<'a, '_>, FdtError> {
        let mut cursor = self.cursor_at(node_off);
        cursor.enter_node()?;
        Ok(SubnodeIter { cursor, done: false })
    }

    /// Read a NUL-terminated string from the strings block at `offset`.
    pub fn string(&self, offset: usize) -> Result<&'a str, FdtError> {
        let range = self.strings_range();
        let start = range.start + offset;
        let bytes = self
            .blob
            .get(start..range.end)
            .ok_or(FdtError::OutOfBounds { cursor: start })?;
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::OutOfBounds { cursor: start })?;
        core::str::from_utf8(&bytes[..nul]).map_err(|_| FdtError::InvalidString { cursor: start })
    }

    /// Look up a `#<name>-cells` style property on the node at `node_off`.
    ///
    /// Returns `Ok(None)` when the node does not carry the property. A
    /// present property must be a single cell with value at most
    /// [MAX_CELLS].
    pub fn cells(&self, node_off: usize, name: &str) -> Result<Option<u32>, FdtError> {
        for prop in self.properties(node_off)? {
            let prop = prop?;
            if prop.name != name {
                continue;
            }
            if prop.data.len() != 4 {
                return Err(FdtError::InvalidCellCount { count: prop.data.len() as u32 });
            }
            let count =
                BigEndian32::from_bytes([prop.data[0], prop.data[1], prop.data[2], prop.data[3]])
                    .value();
            if count > MAX_CELLS {
                return Err(FdtError::InvalidCellCount { count });
            }
            return Ok(Some(count));
        }
        Ok(None)
    }

    /// `#address-cells` of the node at `node_off`, defaulting to 2.
    pub fn address_cells(&self, node_off: usize) -> Result<u32, FdtError> {
        Ok(self.cells(node_off, "#address-cells")?.unwrap_or(ADDRESS_CELLS_DEFAULT))
    }

    /// `#size-cells` of the node at `node_off`, defaulting to 1.
    pub fn size_cells(&self, node_off: usize) -> Result<u32, FdtError> {
        Ok(self.cells(node_off, "#size-cells")?.unwrap_or(SIZE_CELLS_DEFAULT))
    }

    /// Enumerate the memory reservation block.
    ///
    /// The list ends at the all-zero terminator entry. The entries are not
    /// promised to be non-overlapping.
    pub fn memory_reservations(&self) -> ReservedMemoryIter<'a, '_> {
        ReservedMemoryIter { fdt: self, pos: self.header.off_mem_rsvmap as usize, done: false }
    }

    fn be32(&self, cursor: usize) -> Result<u32, FdtError> {
        let bytes = self
            .blob
            .get(cursor..cursor + 4)
            .ok_or(FdtError::OutOfBounds { cursor })?;
        Ok(BigEndian32::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).value())
    }

    fn be64(&self, cursor: usize) -> Result<u64, FdtError> {
        let bytes = self
            .blob
            .get(cursor..cursor + 8)
            .ok_or(FdtError::OutOfBounds { cursor })?;
        Ok(BigEndian64::from_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
        .value())
    }
}

fn parse_header(blob: &[u8]) -> Result<FdtHeader, FdtError> {
    if blob.len() < HEADER_LEN {
        return Err(FdtError::TruncatedBlob { totalsize: blob.len() as u32 });
    }
    let word = |index: usize| {
        let off = index * 4;
        BigEndian32::from_bytes([blob[off], blob[off + 1], blob[off + 2], blob[off + 3]]).value()
    };
    Ok(FdtHeader {
        magic: word(0),
        totalsize: word(1),
        off_dt_struct: word(2),
        off_dt_strings: word(3),
        off_mem_rsvmap: word(4),
        version: word(5),
        last_comp_version: word(6),
        boot_cpuid_phys: word(7),
        size_dt_strings: word(8),
        size_dt_struct: word(9),
    })
}

/// Bounds-checked token cursor over the structure block.
struct Cursor<'a, 'f> {
    fdt: &'f Fdt<'a>,
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a, '_> {
    /// Read the 32-bit word under the cursor without advancing.
    fn peek(&self) -> Result<u32, FdtError> {
        if self.pos + 4 > self.end {
            return Err(FdtError::OutOfBounds { cursor: self.pos });
        }
        self.fdt.be32(self.pos)
    }

    /// Read the 32-bit word under the cursor and advance by 4 bytes.
    fn read(&mut self) -> Result<u32, FdtError> {
        let value = self.peek()?;
        self.pos += 4;
        Ok(value)
    }

    /// Advance past zero words and NOPs to the next meaningful token.
    fn skip_padding(&mut self) -> Result<(), FdtError> {
        loop {
            let token = self.peek()?;
            if token != 0 && token != FdtNodeType::FDT_NOP.bits {
                return Ok(());
            }
            self.pos += 4;
        }
    }

    /// Read a tag word and verify it equals `supposed`.
    fn read_and_check(&mut self, supposed: FdtNodeType) -> Result<(), FdtError> {
        let node_type = self.read()?;
        if node_type != supposed.bits {
            return Err(FdtError::InvalidNodeType { node_type, cursor: self.pos });
        }
        Ok(())
    }

    /// Read a NUL-terminated string and advance to the next aligned position.
    fn read_name(&mut self) -> Result<&'a str, FdtError> {
        let start = self.pos;
        let bytes = self
            .fdt
            .blob
            .get(start..self.end)
            .ok_or(FdtError::OutOfBounds { cursor: start })?;
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::OutOfBounds { cursor: start })?;
        let name = core::str::from_utf8(&bytes[..nul])
            .map_err(|_| FdtError::InvalidString { cursor: start })?;
        self.pos = (start + nul + 1).align_up(4);
        Ok(name)
    }

    /// Read a property entry; the cursor must sit on its `FDT_PROP` token.
    fn read_prop(&mut self) -> Result<RawProperty<'a>, FdtError> {
        self.read_and_check(FdtNodeType::FDT_PROP)?;
        let len = self.read()? as usize;
        let nameoff = self.read()? as usize;
        let start = self.pos;
        if start + len > self.end {
            return Err(FdtError::OutOfBounds { cursor: start });
        }
        let data = &self.fdt.blob[start..start + len];
        self.pos = (start + len).align_up(4);
        let name = self.fdt.string(nameoff)?;
        Ok(RawProperty { name, data })
    }

    /// Skip a property entry without resolving its name.
    fn skip_prop(&mut self) -> Result<(), FdtError> {
        self.read_and_check(FdtNodeType::FDT_PROP)?;
        let len = self.read()? as usize;
        self.read()?; // nameoff
        let start = self.pos;
        if start + len > self.end {
            return Err(FdtError::OutOfBounds { cursor: start });
        }
        self.pos = (start + len).align_up(4);
        Ok(())
    }

    /// Position the cursor just past the name of the node beginning at `pos`.
    fn enter_node(&mut self) -> Result<(), FdtError> {
        self.skip_padding()?;
        self.read_and_check(FdtNodeType::FDT_BEGIN_NODE)?;
        self.read_name()?;
        Ok(())
    }

    /// Skip a whole subtree; the cursor must sit on its `FDT_BEGIN_NODE` token.
    fn skip_node(&mut self) -> Result<(), FdtError> {
        self.read_and_check(FdtNodeType::FDT_BEGIN_NODE)?;
        self.read_name()?;
        let mut depth = 0usize;
        loop {
            self.skip_padding()?;
            let token = self.peek()?;
            if token == FdtNodeType::FDT_BEGIN_NODE.bits {
                self.pos += 4;
                self.read_name()?;
                depth += 1;
            } else if token == FdtNodeType::FDT_PROP.bits {
                self.skip_prop()?;
            } else if token == FdtNodeType::FDT_END_NODE.bits {
                self.pos += 4;
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            } else {
                return Err(FdtError::InvalidNodeType { node_type: token, cursor: self.pos });
            }
        }
    }
}

/// Iterator over the raw properties of one node.
pub struct PropertyIter<'a, 'f> {
    cursor: Cursor<'a, 'f>,
    done: bool,
}

impl<'a> Iterator for PropertyIter<'a, '_> {
    type Item = Result<RawProperty<'a>, FdtError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(err) = self.cursor.skip_padding() {
            self.done = true;
            return Some(Err(err));
        }
        let token = match self.cursor.peek() {
            Ok(token) => token,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        if token != FdtNodeType::FDT_PROP.bits {
            self.done = true;
            return None;
        }
        let prop = self.cursor.read_prop();
        if prop.is_err() {
            self.done = true;
        }
        Some(prop)
    }
}

/// Iterator over the direct subnode offsets of one node.
pub struct SubnodeIter<'a, 'f> {
    cursor: Cursor<'a, 'f>,
    done: bool,
}

impl Iterator for SubnodeIter<'_, '_> {
    type Item = Result<usize, FdtError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Err(err) = self.cursor.skip_padding() {
                self.done = true;
                return Some(Err(err));
            }
            let token = match self.cursor.peek() {
                Ok(token) => token,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            if token == FdtNodeType::FDT_PROP.bits {
                // Stray property after the first subnode began; skip it.
                if let Err(err) = self.cursor.skip_prop() {
                    self.done = true;
                    return Some(Err(err));
                }
            } else if token == FdtNodeType::FDT_BEGIN_NODE.bits {
                let offset = self.cursor.pos;
                if let Err(err) = self.cursor.skip_node() {
                    self.done = true;
                    return Some(Err(err));
                }
                return Some(Ok(offset));
            } else if token == FdtNodeType::FDT_END_NODE.bits {
                self.done = true;
                return None;
            } else {
                self.done = true;
                return Some(Err(FdtError::InvalidNodeType {
                    node_type: token,
                    cursor: self.cursor.pos,
                }));
            }
        }
    }
}

/// Iterator over the memory reservation block.
pub struct ReservedMemoryIter<'a, 'f> {
    fdt: &'f Fdt<'a>,
    pos: usize,
    done: bool,
}

impl Iterator for ReservedMemoryIter<'_, '_> {
    type Item = Result<ReservedMemoryEntry, FdtError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let addr = match self.fdt.be64(self.pos) {
            Ok(addr) => addr,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        let size = match self.fdt.be64(self.pos + 8) {
            Ok(size) => size,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        if addr == 0 && size == 0 {
            self.done = true;
            return None;
        }
        self.pos += RSVMAP_ENTRY_LEN;
        Some(Ok(ReservedMemoryEntry { addr, size }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_dtb::DtbBuilder;
    use alloc::vec::Vec;

    fn two_level_blob() -> Vec<u8> {
        let mut dtb = DtbBuilder::new();
        dtb.begin_node("");
        dtb.prop_cells("#address-cells", &[2]);
        dtb.prop_cells("#size-cells", &[1]);
        dtb.begin_node("soc");
        dtb.prop_str("compatible", "simple-bus");
        dtb.begin_node("uart@10000");
        dtb.prop_cells("reg", &[0, 0x10000, 0x100]);
        dtb.end_node();
        dtb.end_node();
        dtb.begin_node("chosen");
        dtb.end_node();
        dtb.end_node();
        dtb.finish()
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = two_level_blob();
        blob[0] = 0xff;
        assert!(matches!(Fdt::new(&blob), Err(FdtError::InvalidMagic { .. })));
    }

    #[test]
    fn rejects_truncated_blob() {
        let blob = two_level_blob();
        let short = &blob[..blob.len() - 8];
        assert!(matches!(Fdt::new(short), Err(FdtError::TruncatedBlob { .. })));
    }

    #[test]
    fn rejects_old_version() {
        let mut dtb = DtbBuilder::new();
        dtb.begin_node("");
        dtb.end_node();
        let mut blob = dtb.finish();
        // version field lives at word 5
        blob[20..24].copy_from_slice(&15u32.to_be_bytes());
        assert!(matches!(Fdt::new(&blob), Err(FdtError::IncompatibleVersion { .. })));
    }

    #[test]
    fn walks_subnodes_in_blob_order() {
        let blob = two_level_blob();
        let fdt = Fdt::new(&blob).unwrap();
        assert_eq!(fdt.header().version, Fdt::FDT_VERSION);

        let root = fdt.root_offset().unwrap();
        assert_eq!(fdt.node_name(root).unwrap(), "");

        let subnodes: Vec<usize> =
            fdt.subnodes(root).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(subnodes.len(), 2);
        assert_eq!(fdt.node_name(subnodes[0]).unwrap(), "soc");
        assert_eq!(fdt.node_name(subnodes[1]).unwrap(), "chosen");

        let grandchildren: Vec<usize> =
            fdt.subnodes(subnodes[0]).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(grandchildren.len(), 1);
        assert_eq!(fdt.node_name(grandchildren[0]).unwrap(), "uart@10000");
    }

    #[test]
    fn enumerates_properties_with_payloads() {
        let blob = two_level_blob();
        let fdt = Fdt::new(&blob).unwrap();
        let root = fdt.root_offset().unwrap();

        let props: Vec<RawProperty<'_>> =
            fdt.properties(root).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "#address-cells");
        assert_eq!(props[0].data, &[0, 0, 0, 2]);
        assert_eq!(props[1].name, "#size-cells");
    }

    #[test]
    fn cells_lookup_and_defaults() {
        let blob = two_level_blob();
        let fdt = Fdt::new(&blob).unwrap();
        let root = fdt.root_offset().unwrap();
        let soc = fdt.subnodes(root).unwrap().next().unwrap().unwrap();

        assert_eq!(fdt.address_cells(root).unwrap(), 2);
        assert_eq!(fdt.size_cells(root).unwrap(), 1);
        // soc declares neither; walker defaults apply
        assert_eq!(fdt.address_cells(soc).unwrap(), ADDRESS_CELLS_DEFAULT);
        assert_eq!(fdt.size_cells(soc).unwrap(), SIZE_CELLS_DEFAULT);
        assert_eq!(fdt.cells(soc, "#interrupt-cells").unwrap(), None);
    }

    #[test]
    fn cells_rejects_wide_or_oversized_values() {
        let mut dtb = DtbBuilder::new();
        dtb.begin_node("");
        dtb.prop_cells("#clock-cells", &[1, 2]);
        dtb.prop_cells("#dma-cells", &[9]);
        dtb.end_node();
        let blob = dtb.finish();
        let fdt = Fdt::new(&blob).unwrap();
        let root = fdt.root_offset().unwrap();

        assert!(matches!(
            fdt.cells(root, "#clock-cells"),
            Err(FdtError::InvalidCellCount { count: 8 })
        ));
        assert!(matches!(
            fdt.cells(root, "#dma-cells"),
            Err(FdtError::InvalidCellCount { count: 9 })
        ));
    }

    #[test]
    fn enumerates_memory_reservations() {
        let mut dtb = DtbBuilder::new();
        dtb.reserve_memory(0x4000_0000, 0x1000);
        dtb.reserve_memory(0x8000_0000, 0x2000);
        dtb.begin_node("");
        dtb.end_node();
        let blob = dtb.finish();
        let fdt = Fdt::new(&blob).unwrap();

        let entries: Vec<ReservedMemoryEntry> =
            fdt.memory_reservations().collect::<Result<_, _>>().unwrap();
        assert_eq!(
            entries,
            [
                ReservedMemoryEntry { addr: 0x4000_0000, size: 0x1000 },
                ReservedMemoryEntry { addr: 0x8000_0000, size: 0x2000 },
            ]
        );
    }

    #[test]
    fn skips_nop_tokens_before_root() {
        let mut dtb = DtbBuilder::new();
        dtb.nop();
        dtb.begin_node("");
        dtb.nop();
        dtb.prop_cells("#address-cells", &[1]);
        dtb.prop_cells("#size-cells", &[1]);
        dtb.end_node();
        let blob = dtb.finish();
        let fdt = Fdt::new(&blob).unwrap();
        let root = fdt.root_offset().unwrap();
        assert_eq!(fdt.address_cells(root).unwrap(), 1);
    }
}
