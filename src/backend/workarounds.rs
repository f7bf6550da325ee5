// Device-specific workarounds
//
// An ordered rule table checked against the selected device before the
// logical device is created. A matching rule is announced as a warning and its
// action runs; an action error aborts device setup.

use anyhow::{bail, Result};

use super::device::DeviceDescriptor;
use crate::context::BackendContext;
use crate::error::BackendError;

const TARGET: &str = "vkscene::device";

pub type WorkaroundFilter = Box<dyn Fn(&DeviceDescriptor) -> bool + Send + Sync>;
pub type WorkaroundAction = Box<dyn Fn(&DeviceDescriptor, &BackendContext) -> Result<()> + Send + Sync>;

pub struct DeviceWorkaround {
    pub description: String,
    filter: WorkaroundFilter,
    action: WorkaroundAction,
}

impl DeviceWorkaround {
    pub fn new(
        description: impl Into<String>,
        filter: impl Fn(&DeviceDescriptor) -> bool + Send + Sync + 'static,
        action: impl Fn(&DeviceDescriptor, &BackendContext) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            filter: Box::new(filter),
            action: Box::new(action),
        }
    }

    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        (self.filter)(device)
    }
}

#[derive(Default)]
pub struct WorkaroundTable {
    rules: Vec<DeviceWorkaround>,
}

impl WorkaroundTable {
    /// The built-in table. Currently empty; see [`nvidia_next_gen_compiler`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rule: DeviceWorkaround) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs every rule matching `device`, in table order. Returns how many fired.
    pub fn apply(&self, device: &DeviceDescriptor, ctx: &BackendContext) -> Result<usize> {
        if ctx.config().device.disable_workarounds {
            ctx.warn(
                TARGET,
                "Device-specific workarounds disabled upon request, expect weird things to happen.",
            );
            return Ok(0);
        }

        let mut fired = 0;
        for rule in self.rules.iter().filter(|r| r.matches(device)) {
            ctx.warn(TARGET, format_args!("Workaround activated: {}", rule.description));
            (rule.action)(device, ctx).map_err(|e| BackendError::WorkaroundAborted {
                description: rule.description.clone(),
                reason: format!("{:#}", e),
            })?;
            fired += 1;
        }
        Ok(fired)
    }
}

pub const NEXT_GEN_COMPILER_ENV: &str = "__GL_NextGenCompiler";

/// Nvidia 396+ drivers crash the renderer unless `__GL_NextGenCompiler` is set.
/// Not part of the default table.
pub fn nvidia_next_gen_compiler() -> DeviceWorkaround {
    DeviceWorkaround::new(
        "Nvidia 396.xx series drivers are unsupported due to crashing bugs in the driver",
        |device| device.vendor == "Nvidia" && device.driver_major().is_some_and(|major| major >= 396),
        |device, ctx| check_next_gen_compiler(device, std::env::var(NEXT_GEN_COMPILER_ENV).ok(), ctx),
    )
}

fn check_next_gen_compiler(
    device: &DeviceDescriptor,
    setting: Option<String>,
    ctx: &BackendContext,
) -> Result<()> {
    if setting.is_some() {
        return Ok(());
    }
    ctx.warn(
        TARGET,
        format_args!(
            "The graphics driver version you are using ({}) contains a bug that prevents the Vulkan renderer from functioning correctly.",
            device.driver_version
        ),
    );
    ctx.warn(
        TARGET,
        format_args!(
            "Please set the environment variable {}=0 and restart the application to work around this issue.",
            NEXT_GEN_COMPILER_ENV
        ),
    );
    bail!("bug in graphics driver {}", device.driver_version)
}
