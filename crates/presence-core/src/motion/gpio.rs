//! Raspberry Pi sensor pin.
//!
//! Watches a BCM-numbered input with a pull-down for rising edges and turns
//! each edge into a [`MotionTrigger`] call. The interrupt thread belongs to
//! `rppal`; it never touches detector state.

use rppal::gpio::{Gpio, InputPin, Trigger};

use super::{MotionError, MotionTrigger};

const TARGET: &str = "presence::motion";

/// A watched sensor pin. Dropping it stops the interrupt.
#[derive(Debug)]
pub struct MotionPin {
    pin: InputPin,
}

impl MotionPin {
    /// Configure `pin` as a pulled-down input and deliver rising edges to
    /// `trigger`.
    ///
    /// # Errors
    ///
    /// Returns [`MotionError::Gpio`] if the GPIO peripheral or pin is unavailable.
    pub fn watch(pin: u8, trigger: MotionTrigger) -> Result<Self, MotionError> {
        let gpio_error = |err: rppal::gpio::Error| MotionError::Gpio {
            pin,
            message: err.to_string(),
        };
        let mut input = Gpio::new()
            .map_err(gpio_error)?
            .get(pin)
            .map_err(gpio_error)?
            .into_input_pulldown();
        input
            .set_async_interrupt(Trigger::RisingEdge, None, move |_event| {
                trigger.trigger();
            })
            .map_err(gpio_error)?;
        tracing::info!(target: TARGET, pin, "watching sensor pin");
        Ok(Self { pin: input })
    }

    /// BCM pin number.
    pub fn number(&self) -> u8 {
        self.pin.pin()
    }
}
