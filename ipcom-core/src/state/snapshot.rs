//! Decoded device state.
//!
//! A [`StateSnapshot`] is built once from a `StateSnapshot` frame and then
//! handed out behind an `Arc`; nothing mutates it after publication.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::message::{Address, wire_to_percent};

// ── DeviceState ──────────────────────────────────────────────────

/// Last known value of one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub address: Address,
    /// Raw wire intensity, 0 = off, 255 = full on.
    pub value: u8,
}

impl DeviceState {
    pub fn new(address: Address, value: u8) -> Self {
        Self { address, value }
    }

    pub fn is_on(&self) -> bool {
        self.value > 0
    }

    /// Brightness as a rounded display percentage (0..=100).
    pub fn brightness_percent(&self) -> u8 {
        wire_to_percent(self.value)
    }
}

// ── StateSnapshot ────────────────────────────────────────────────

/// Full device state at one instant, ordered by `(module, output)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    sequence: u64,
    timestamp: SystemTime,
    devices: BTreeMap<Address, DeviceState>,
}

impl StateSnapshot {
    /// Build a snapshot from `(address, value)` pairs. A repeated address
    /// keeps the last value seen.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (Address, u8)>,
    {
        let devices = values
            .into_iter()
            .map(|(addr, value)| (addr, DeviceState::new(addr, value)))
            .collect();
        Self {
            sequence: 0,
            timestamp: SystemTime::now(),
            devices,
        }
    }

    /// Stamp the publication order. Only the publisher calls this, before
    /// the snapshot is shared.
    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Publication order within the engine's lifetime, starting at 1.
    /// Zero means the snapshot was never published.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn get(&self, address: Address) -> Option<&DeviceState> {
        self.devices.get(&address)
    }

    /// Raw value of a single output, if the controller reported it.
    pub fn value(&self, module: u8, output: u8) -> Option<u8> {
        self.get(Address::new(module, output)).map(|d| d.value)
    }

    /// Every reported output of one module, ordered by output id.
    pub fn module_values(&self, module: u8) -> Vec<(u8, u8)> {
        self.devices
            .range(Address::new(module, 0)..=Address::new(module, u8::MAX))
            .map(|(addr, d)| (addr.output, d.value))
            .collect()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────
