// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Id of the design document holding the access configuration.
pub const DEFAULT_DESIGN_ID: &str = "_design/access";

/// Configuration for an access design instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Document id the design is read from and written to.
    pub(crate) design_id: String,

    /// How long `schedule_save` waits for more changes before saving.
    pub(crate) save_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            design_id: DEFAULT_DESIGN_ID.to_string(),
            save_delay: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_design_id(mut self, design_id: &str) -> Self {
        self.design_id = design_id.to_string();
        self
    }

    pub fn with_save_delay(mut self, save_delay: Duration) -> Self {
        self.save_delay = save_delay;
        self
    }

    pub fn design_id(&self) -> &str {
        &self.design_id
    }

    pub fn save_delay(&self) -> Duration {
        self.save_delay
    }
}
