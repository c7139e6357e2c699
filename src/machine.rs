// src/machine.rs - Toolhead/heater state as seen by the job stream
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Everything needed to put the machine back where a print left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// X, Y, Z, E
    pub position: [f64; 4],
    pub extruder_target: f64,
    pub bed_target: f64,
    pub absolute_coordinates: bool,
    pub absolute_extrude: bool,
    /// mm/min
    pub feedrate: f64,
}

impl Default for MachineSnapshot {
    fn default() -> Self {
        Self {
            position: [0.0; 4],
            extruder_target: 0.0,
            bed_target: 0.0,
            absolute_coordinates: true,
            absolute_extrude: true,
            feedrate: 1500.0,
        }
    }
}

pub trait MachineState: Send + Sync {
    fn snapshot(&self) -> MachineSnapshot;
}

/// Machine state that never moves. Used when nothing better is wired in.
#[derive(Debug, Default)]
pub struct IdleMachine;

impl MachineState for IdleMachine {
    fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot::default()
    }
}

/// Follows the G-code passing through the dispatcher and keeps a running
/// estimate of toolhead position, modes, and heater targets.
#[derive(Debug, Default)]
pub struct TrackedMachine {
    state: Mutex<MachineSnapshot>,
}

impl TrackedMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the estimate from one dispatched line.
    pub fn observe(&self, line: &str) {
        let code = line.split(';').next().unwrap_or("").trim();
        let mut parts = code.split_whitespace();
        let Some(command) = parts.next() else {
            return;
        };
        let params: Vec<&str> = parts.collect();
        let Ok(mut state) = self.state.lock() else {
            tracing::warn!("Machine state lock poisoned; ignoring '{}'", line);
            return;
        };
        match command.to_ascii_uppercase().as_str() {
            "G0" | "G1" => {
                for (axis, value) in axis_words(&params) {
                    match axis {
                        'F' => state.feedrate = value,
                        _ => {
                            let Some(index) = axis_index(axis) else { continue };
                            let relative = if index == 3 {
                                !state.absolute_extrude || !state.absolute_coordinates
                            } else {
                                !state.absolute_coordinates
                            };
                            if relative {
                                state.position[index] += value;
                            } else {
                                state.position[index] = value;
                            }
                        }
                    }
                }
            }
            "G92" => {
                for (axis, value) in axis_words(&params) {
                    if let Some(index) = axis_index(axis) {
                        state.position[index] = value;
                    }
                }
            }
            "G90" => state.absolute_coordinates = true,
            "G91" => state.absolute_coordinates = false,
            "M82" => state.absolute_extrude = true,
            "M83" => state.absolute_extrude = false,
            "M104" | "M109" => {
                if let Some(temp) = s_word(&params) {
                    state.extruder_target = temp;
                }
            }
            "M140" | "M190" => {
                if let Some(temp) = s_word(&params) {
                    state.bed_target = temp;
                }
            }
            _ => {}
        }
    }
}

impl MachineState for TrackedMachine {
    fn snapshot(&self) -> MachineSnapshot {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn axis_index(axis: char) -> Option<usize> {
    match axis {
        'X' => Some(0),
        'Y' => Some(1),
        'Z' => Some(2),
        'E' => Some(3),
        _ => None,
    }
}

fn axis_words(params: &[&str]) -> Vec<(char, f64)> {
    let mut words = Vec::new();
    for part in params {
        let mut chars = part.chars();
        let Some(letter) = chars.next() else { continue };
        let value_str = chars.as_str();
        match value_str.parse::<f64>() {
            Ok(value) => words.push((letter.to_ascii_uppercase(), value)),
            Err(e) => tracing::debug!("Failed to parse parameter '{}': {}", part, e),
        }
    }
    words
}

fn s_word(params: &[&str]) -> Option<f64> {
    axis_words(params)
        .into_iter()
        .find(|(letter, _)| *letter == 'S')
        .map(|(_, value)| value)
}
