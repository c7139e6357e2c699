// src/gcode.rs - Host side command dispatcher
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

use crate::commands::{self, SdCommand};
use crate::dispatch::{CommandDispatcher, DispatchError, GCodeMutex};
use crate::machine::TrackedMachine;
use crate::print_job::PrintJobController;

/// Runs one line at a time under a [`GCodeMutex`]. SD card commands go to
/// the print job controller; everything else updates the tracked machine
/// state.
pub struct HostDispatcher {
    mutex: GCodeMutex,
    controller: OnceLock<PrintJobController>,
    machine: Arc<TrackedMachine>,
}

impl HostDispatcher {
    pub fn new(machine: Arc<TrackedMachine>) -> Self {
        Self {
            mutex: GCodeMutex::new(),
            controller: OnceLock::new(),
            machine,
        }
    }

    /// Connect the controller that handles SD card commands. Only the first
    /// call has an effect.
    pub fn attach(&self, controller: PrintJobController) {
        if self.controller.set(controller).is_err() {
            tracing::warn!("Print job controller already attached");
        }
    }

    /// Run a command from an interactive source and collect its responses.
    pub async fn run_interactive(&self, line: &str) -> Result<Vec<String>, DispatchError> {
        self.mutex.run(self.execute(line)).await
    }

    async fn execute(&self, line: &str) -> Result<Vec<String>, DispatchError> {
        let code = line.split(';').next().unwrap_or("").trim();
        if code.is_empty() {
            return Ok(Vec::new());
        }
        let sd_command = SdCommand::parse(code).map_err(|e| DispatchError::Command(e.reply().to_string()))?;
        let Some(sd_command) = sd_command else {
            self.machine.observe(code);
            return Ok(Vec::new());
        };
        let Some(controller) = self.controller.get() else {
            return Err(DispatchError::Internal("no print job controller attached".to_string()));
        };
        commands::execute(controller, sd_command)
            .await
            .map_err(|e| DispatchError::Command(e.reply().to_string()))
    }
}

#[async_trait]
impl CommandDispatcher for HostDispatcher {
    async fn dispatch(&self, line: &str) -> Result<(), DispatchError> {
        for response in self.mutex.run(self.execute(line)).await? {
            tracing::info!("// {}", response);
        }
        Ok(())
    }

    fn has_pending_request(&self) -> bool {
        self.mutex.test()
    }
}
