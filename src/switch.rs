//! Host facing on/off switches bound to a driver instance.
//!
//! A switch does not touch the bus. It records the request on its parent
//! driver, which applies it at the start of the next poll tick.

use core::cell::RefCell;

/// Driver feature a switch controls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchFeature {
    /// Measurement running or stopped.
    Measurement,
    /// Output divider enabled or disabled.
    Divider,
}

/// A driver a switch can be bound to.
pub trait SwitchTarget {
    /// Current state of `feature`.
    fn switch_state(&self, feature: SwitchFeature) -> bool;

    /// Request a new state of `feature`.
    fn apply_switch(&mut self, feature: SwitchFeature, on: bool);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchError {
    /// The switch is not bound to a driver yet.
    NoParent,
    /// The driver is borrowed elsewhere, e.g. inside a running poll tick.
    Busy,
}

impl core::fmt::Display for SwitchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SwitchError::NoParent => write!(f, "switch has no parent"),
            SwitchError::Busy => write!(f, "parent is busy"),
        }
    }
}

impl core::error::Error for SwitchError {}

/// An on/off switch for one [`SwitchFeature`] of a shared driver.
#[derive(Debug)]
pub struct AS7331Switch<'a, P> {
    feature: SwitchFeature,
    parent: Option<&'a RefCell<P>>,
    state: bool,
}

impl<'a, P: SwitchTarget> AS7331Switch<'a, P> {
    pub fn new(feature: SwitchFeature) -> Self {
        Self {
            feature,
            parent: None,
            state: false,
        }
    }

    pub fn feature(&self) -> SwitchFeature {
        self.feature
    }

    /// Last state reported to the host.
    pub fn state(&self) -> bool {
        self.state
    }

    /// Bind the switch to `parent` and return the state it reports initially.
    pub fn set_parent(&mut self, parent: &'a RefCell<P>) -> Result<bool, SwitchError> {
        let current = parent
            .try_borrow()
            .map_err(|_| SwitchError::Busy)?
            .switch_state(self.feature);

        self.parent = Some(parent);
        self.state = current;
        Ok(current)
    }

    /// Forward a state change requested by the host.
    ///
    /// Returns the state to report back, which is `on` once the parent
    /// accepted it.
    pub fn on_state_change(&mut self, on: bool) -> Result<bool, SwitchError> {
        let parent = self.parent.ok_or(SwitchError::NoParent)?;
        parent
            .try_borrow_mut()
            .map_err(|_| SwitchError::Busy)?
            .apply_switch(self.feature, on);

        log::debug!("{:?} switch -> {}", self.feature, on);
        self.state = on;
        Ok(on)
    }
}
