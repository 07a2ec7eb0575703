/*!
 * Generic SCPI driver, used when a stream device cannot be matched to
 * anything more specific.
 */
use std::collections::BTreeSet;

use async_trait::async_trait;

use benchflow_core::types::Value;

use crate::contract::{CallArgs, CapabilityContract};
use crate::driver::{reply_value, required, Capability, Driver, DriverFactory, InstrumentCore};
use crate::error::Result;

/// Raw command access with the IEEE 488.2 common commands
#[derive(Debug)]
pub struct GenericScpi {
    core: InstrumentCore,
}

#[async_trait]
impl Driver for GenericScpi {
    fn core(&self) -> &InstrumentCore {
        &self.core
    }

    fn operations(&self) -> Vec<&str> {
        vec!["write", "query", "identify", "reset", "clear_status"]
    }

    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
        match operation {
            "write" => {
                let command = required(args, "command")?.to_string();
                self.core.write(&command).await?;
                Ok(Value::Null)
            }
            "query" => {
                let command = required(args, "command")?.to_string();
                Ok(reply_value(self.core.query(&command).await?))
            }
            "identify" => Ok(Value::String(self.core.query("*IDN?").await?)),
            "reset" => {
                self.core.write("*RST").await?;
                Ok(Value::Null)
            }
            _ => {
                self.core.write("*CLS").await?;
                Ok(Value::Null)
            }
        }
    }
}

/// Factory for [`GenericScpi`]
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericScpiFactory;

impl GenericScpiFactory {
    /// Class path of the generic driver
    pub const CLASS_PATH: &'static str = concat!(module_path!(), "::GenericScpi");
}

impl DriverFactory for GenericScpiFactory {
    fn class_path(&self) -> &str {
        Self::CLASS_PATH
    }

    fn identity_markers(&self) -> Vec<String> {
        Vec::new()
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        [Capability::Scpi].into_iter().collect()
    }

    fn contract(&self) -> CapabilityContract {
        CapabilityContract::new()
    }

    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
        Ok(Box::new(GenericScpi { core }))
    }
}
