//! Synthesizes DTB blobs for tests.

use alloc::{string::String, vec::Vec};

pub struct DtbBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
    names: Vec<(String, u32)>,
    reservations: Vec<(u64, u64)>,
}

impl DtbBuilder {
    pub fn new() -> DtbBuilder {
        DtbBuilder {
            structure: Vec::new(),
            strings: Vec::new(),
            names: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn reserve_memory(&mut self, addr: u64, size: u64) {
        self.reservations.push((addr, size));
    }

    pub fn nop(&mut self) {
        self.token(4);
    }

    pub fn begin_node(&mut self, name: &str) {
        self.token(1);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
    }

    pub fn end_node(&mut self) {
        self.token(2);
    }

    pub fn prop_bytes(&mut self, name: &str, data: &[u8]) {
        let nameoff = self.name_offset(name);
        self.token(3);
        self.structure.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.structure.extend_from_slice(&nameoff.to_be_bytes());
        self.structure.extend_from_slice(data);
        self.pad();
    }

    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) {
        let mut data = Vec::new();
        for cell in cells {
            data.extend_from_slice(&cell.to_be_bytes());
        }
        self.prop_bytes(name, &data);
    }

    pub fn prop_str(&mut self, name: &str, value: &str) {
        let mut data = Vec::from(value.as_bytes());
        data.push(0);
        self.prop_bytes(name, &data);
    }

    pub fn prop_empty(&mut self, name: &str) {
        self.prop_bytes(name, &[]);
    }

    fn token(&mut self, token: u32) {
        self.structure.extend_from_slice(&token.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn name_offset(&mut self, name: &str) -> u32 {
        if let Some((_, off)) = self.names.iter().find(|(n, _)| n == name) {
            return *off;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.names.push((String::from(name), off));
        off
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.token(9);

        let rsvmap_len = (self.reservations.len() + 1) * 16;
        let off_mem_rsvmap = 40;
        let off_dt_struct = off_mem_rsvmap + rsvmap_len;
        let off_dt_strings = off_dt_struct + self.structure.len();
        let totalsize = off_dt_strings + self.strings.len();

        let mut blob = Vec::with_capacity(totalsize);
        for word in [
            0xd00dfeedu32,
            totalsize as u32,
            off_dt_struct as u32,
            off_dt_strings as u32,
            off_mem_rsvmap as u32,
            17, // version
            16, // last compatible version
            0,  // boot cpu
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            blob.extend_from_slice(&word.to_be_bytes());
        }
        for (addr, size) in &self.reservations {
            blob.extend_from_slice(&addr.to_be_bytes());
            blob.extend_from_slice(&size.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; 16]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}
