//! Shared helpers for foldwatch-parse integration tests.

#![allow(dead_code)]

pub use foldwatch_common::testing::init_test_logging;

use foldwatch_parse::queue::{QUEUE_SIZE, SLOT_SIZE, SLOTS_OFFSET};

/// Load a fixture file by name.
pub fn fixture(name: &str) -> &'static str {
    match name {
        "FAHlog.txt" => include_str!("../fixtures/FAHlog.txt"),
        "unitinfo.txt" => include_str!("../fixtures/unitinfo.txt"),
        other => panic!("unknown fixture {other}"),
    }
}

/// Builds a synthetic queue snapshot byte by byte.
pub struct QueueImage {
    bytes: Vec<u8>,
}

impl QueueImage {
    pub fn new(version: u32, current_index: u32) -> Self {
        let mut image = Self {
            bytes: vec![0; QUEUE_SIZE],
        };
        image.put(0, &version.to_le_bytes());
        image.put(4, &current_index.to_le_bytes());
        image
    }

    pub fn put(&mut self, offset: usize, data: &[u8]) -> &mut Self {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self
    }

    /// Write `data` at `offset` within slot `slot`.
    pub fn slot(&mut self, slot: usize, offset: usize, data: &[u8]) -> &mut Self {
        assert!(offset + data.len() <= SLOT_SIZE);
        self.put(SLOTS_OFFSET + slot * SLOT_SIZE + offset, data)
    }

    pub fn slot_u32_le(&mut self, slot: usize, offset: usize, value: u32) -> &mut Self {
        self.slot(slot, offset, &value.to_le_bytes())
    }

    pub fn slot_u32_be(&mut self, slot: usize, offset: usize, value: u32) -> &mut Self {
        self.slot(slot, offset, &value.to_be_bytes())
    }

    pub fn slot_u16_le(&mut self, slot: usize, offset: usize, value: u16) -> &mut Self {
        self.slot(slot, offset, &value.to_le_bytes())
    }

    /// Project/run/clone/gen at their slot offsets.
    pub fn slot_identity(&mut self, slot: usize, p: u16, r: u16, c: u16, g: u16) -> &mut Self {
        self.slot_u16_le(slot, 208, p)
            .slot_u16_le(slot, 210, r)
            .slot_u16_le(slot, 212, c)
            .slot_u16_le(slot, 214, g)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
